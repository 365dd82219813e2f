//! Persona services — one per role this vault plays in its replication
//! groups.  Each service wires the same pipeline: accumulator (dedup +
//! sender quorum) → unresolved log (group quorum) → account database,
//! with the synchronizer shipping proposals in between.

pub mod data_manager;
pub mod maid_manager;
pub mod pmid_manager;
pub mod pmid_node;
pub mod version_manager;

pub use data_manager::DataManager;
pub use maid_manager::MaidManager;
pub use pmid_manager::PmidManager;
pub use pmid_node::PmidNode;
pub use version_manager::VersionManager;

use crate::accumulator::{Accumulator, AddResult, Fingerprint};
use crate::error::{Result, VaultError};
use crate::routing::{MessageId, SrcAuthority};

/// Outcome of pushing one inbound request through the accumulator.
pub(crate) enum Admit {
    /// Quorum met; this vault now owns the request.
    Admitted,
    /// Counted but short of quorum, or a repeat from a counted sender.
    Pending,
    /// Already handled; any cached reply should be replayed.
    AlreadyHandled(Option<Vec<u8>>),
}

/// The accumulator step shared by every handler: dedup, count the sender,
/// and mark the request handled the moment it is admitted.
pub(crate) fn admit(
    accumulator: &mut Accumulator,
    src: &SrcAuthority,
    message_id: MessageId,
    group_size: usize,
) -> Admit {
    let fingerprint = Fingerprint::new(message_id, src);
    if accumulator.check_handled(&fingerprint) {
        return Admit::AlreadyHandled(accumulator.cached_reply(&fingerprint));
    }
    match accumulator.add_pending(fingerprint, src.sender(), src.required_count(group_size)) {
        AddResult::Success => {
            accumulator.set_handled(fingerprint, None);
            Admit::Admitted
        }
        AddResult::Duplicate => Admit::AlreadyHandled(accumulator.cached_reply(&fingerprint)),
        AddResult::Waiting | AddResult::Rejected => Admit::Pending,
    }
}

pub(crate) fn expect_group(src: &SrcAuthority) -> Result<()> {
    if src.is_group() {
        Ok(())
    } else {
        Err(VaultError::UnauthorizedSender)
    }
}

pub(crate) fn expect_single(src: &SrcAuthority) -> Result<()> {
    if src.is_group() {
        Err(VaultError::UnauthorizedSender)
    } else {
        Ok(())
    }
}
