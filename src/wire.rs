//! Wire message types and the CBOR helpers shared by every persona.
//!
//! Everything that crosses the router is a [`Frame`] serialised with
//! ciborium.  Encoding is deterministic for equal values: payload structs
//! use ordered containers only, so two honest vaults produce byte-identical
//! frames for the same logical message.

use ciborium::{from_reader, into_writer};
use serde::{Deserialize, Serialize};

use crate::actions::PmidRecord;
use crate::error::VaultError;
use crate::name::{DataName, Identity, MaidName, PmidName};
use crate::routing::{MessageId, PeerId, SrcAuthority};
use crate::versions::VersionName;

// ─── CBOR helpers ────────────────────────────────────────────────────────────

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, VaultError> {
    let mut buf = Vec::new();
    into_writer(value, &mut buf).map_err(|e| VaultError::StorageFault(e.to_string()))?;
    Ok(buf)
}

pub fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, VaultError> {
    from_reader(bytes).map_err(|_| VaultError::MalformedMessage)
}

// ─── Personas ────────────────────────────────────────────────────────────────

/// The role a message is addressed to.  The dispatcher demultiplexes on
/// this tag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persona {
    MaidManager,
    DataManager,
    PmidManager,
    VersionManager,
    PmidNode,
}

impl Persona {
    /// Account-id prefix: keeps each persona's accounts in a disjoint
    /// region of the shared store.
    pub fn account_prefix(self) -> &'static str {
        match self {
            Persona::MaidManager => "mm:",
            Persona::DataManager => "dm:",
            Persona::PmidManager => "pm:",
            Persona::VersionManager => "vm:",
            Persona::PmidNode => "pn:",
        }
    }

    pub fn for_account(account: &str) -> Option<Persona> {
        [
            Persona::MaidManager,
            Persona::DataManager,
            Persona::PmidManager,
            Persona::VersionManager,
            Persona::PmidNode,
        ]
        .into_iter()
        .find(|p| account.starts_with(p.account_prefix()))
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// One entry of a synchronisation broadcast: a locally unresolved action
/// being shipped to the rest of the close group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub owner: Identity,
    pub name: DataName,
    /// CBOR of the persona-specific action.
    pub action: Vec<u8>,
    pub message_id: MessageId,
    pub originator: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    // Client → MaidManager.
    ClientPut { client: MaidName, name: DataName, content: Vec<u8> },
    ClientDelete { client: MaidName, name: DataName },
    RegisterPmid { client: MaidName, pmid: PmidName },
    UnregisterPmid { client: MaidName, pmid: PmidName },
    GetAccountInfo { client: MaidName },
    /// PmidManager group → MaidManager: refreshed rollup for a holder the
    /// client registered.
    HolderHealth { client: MaidName, pmid: PmidName, record: PmidRecord },

    // MaidManager group → DataManager.
    Put { name: DataName, content: Vec<u8> },
    Delete { name: DataName },
    Get { name: DataName },
    HolderDown { name: DataName, pmid: PmidName },
    HolderUp { name: DataName, pmid: PmidName },

    // DataManager group → PmidManager.
    ForwardPut { holder: PmidName, name: DataName, content: Vec<u8> },
    ForwardDelete { holder: PmidName, name: DataName, size: u64 },
    UpdateHealth { holder: PmidName, available_size: u64 },

    // PmidManager group → PmidNode.
    ChunkPut { name: DataName, content: Vec<u8> },
    ChunkGet { name: DataName },
    ChunkDelete { name: DataName },

    // Client → VersionManager.
    PutVersion { name: DataName, old: Option<VersionName>, new: VersionName },
    GetVersions { name: DataName },
    GetBranch { name: DataName, tip: VersionName },
    DeleteBranchUntilFork { name: DataName, tip: VersionName },

    // Peer → peer, within one close group.
    Sync { entries: Vec<SyncEnvelope> },

    // Churn account transfer.
    SnapshotRequest { account: String },
    SnapshotResponse { account: String, snapshot: Vec<u8> },
    AccountTransfer { account: String, snapshot: Vec<u8> },
    TransferAck { account: String },
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    PutSuccess { name: DataName },
    PutFailure { name: DataName, error: VaultError },
    GetSuccess { name: DataName, content: Vec<u8> },
    /// Online replica holders for a data element; the caller fetches the
    /// chunk from one of them directly.
    Holders { name: DataName, holders: Vec<PmidName> },
    AccountInfo { data_stored: u64, space_available: u64 },
    Versions { names: Vec<VersionName> },
    Branch { names: Vec<VersionName> },
    Failure { error: VaultError },
}

// ─── Frame ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Request {
        persona: Persona,
        src: SrcAuthority,
        message_id: MessageId,
        request: Request,
    },
    Response {
        src: SrcAuthority,
        message_id: MessageId,
        response: Response,
    },
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, VaultError> {
        encode_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        decode_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{DataKind, IDENTITY_SIZE};

    fn identity(fill: u8) -> Identity {
        Identity([fill; IDENTITY_SIZE])
    }

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::Request {
            persona: Persona::DataManager,
            src: SrcAuthority::Group { group: identity(1), peer: PeerId([2; 64]) },
            message_id: MessageId(42),
            request: Request::Put {
                name: DataName::new(DataKind::ImmutableData, identity(3)),
                content: vec![1, 2, 3],
            },
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn equal_frames_encode_identically() {
        let make = || Frame::Response {
            src: SrcAuthority::Single { peer: PeerId([9; 64]) },
            message_id: MessageId(7),
            response: Response::AccountInfo { data_stored: 10, space_available: 490 },
        };
        assert_eq!(make().to_bytes().unwrap(), make().to_bytes().unwrap());
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(Frame::from_bytes(b"not cbor").unwrap_err(), VaultError::MalformedMessage);
    }

    #[test]
    fn persona_prefixes_are_distinct() {
        let prefixes = [
            Persona::MaidManager,
            Persona::DataManager,
            Persona::PmidManager,
            Persona::VersionManager,
            Persona::PmidNode,
        ]
        .map(Persona::account_prefix);
        for (i, a) in prefixes.iter().enumerate() {
            for b in &prefixes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
