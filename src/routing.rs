//! The overlay routing layer, as consumed by the vault.
//!
//! The real P2P overlay lives outside this crate.  The harness that owns
//! it hands the vault an implementation of [`Router`] and feeds inbound
//! bytes into `Vault::handle_message`.  Sends are fire-and-forget: the
//! router queues them and never blocks a persona's critical section.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::name::{Identity, IDENTITY_SIZE};

/// Opaque fixed-width overlay node id.  A vault's overlay id doubles as
/// its data-holder name, so the two convert freely.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "BigArray")] pub [u8; IDENTITY_SIZE]);

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({}..)", hex::encode(&self.0[..3]))
    }
}

impl From<PeerId> for Identity {
    fn from(peer: PeerId) -> Identity {
        Identity(peer.0)
    }
}

impl From<Identity> for PeerId {
    fn from(identity: Identity) -> PeerId {
        PeerId(identity.0)
    }
}

/// Request identifier; also the deterministic tiebreaker for concurrent
/// actions on the same key (higher id wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn random() -> Self {
        MessageId(rand::random())
    }
}

// ─── Authorities ─────────────────────────────────────────────────────────────

/// Who a message claims to come from.
///
/// A `Single` source is one node speaking for itself (a client, or a data
/// holder).  A `Group` source is one member of the close group responsible
/// for `group`; such requests only count once a quorum of distinct members
/// has sent the identical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SrcAuthority {
    Single { peer: PeerId },
    Group { group: Identity, peer: PeerId },
}

impl SrcAuthority {
    pub fn sender(&self) -> PeerId {
        match self {
            SrcAuthority::Single { peer } => *peer,
            SrcAuthority::Group { peer, .. } => *peer,
        }
    }

    /// Distinct senders required before a request is admitted.
    pub fn required_count(&self, group_size: usize) -> usize {
        match self {
            SrcAuthority::Single { .. } => 1,
            SrcAuthority::Group { .. } => group_size - 1,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, SrcAuthority::Group { .. })
    }
}

/// Where an outbound message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Peer(PeerId),
    /// The close group responsible for the identity.
    Group(Identity),
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub trait Router: Send + Sync {
    fn our_id(&self) -> PeerId;

    /// The deterministic set of peers (size `group_size`) closest to
    /// `target`, including this vault when it is one of them.
    fn close_group(&self, target: &Identity) -> Vec<PeerId>;

    /// Queue bytes for delivery.  Never blocks.
    fn send(&self, dst: Destination, bytes: Vec<u8>);
}
