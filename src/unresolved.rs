//! The unresolved-action log: every action this vault has proposed
//! locally plus every matching proposal received from peers, keyed by
//! `(account owner, name, action, message_id)`.
//!
//! An entry commits once `group_size - 1` distinct originators have
//! proposed it AND this vault is one of them — a vault never applies an
//! action it did not independently derive from the inbound request.
//! Entries that never reach quorum age out after a TTL.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::debug;

use crate::name::{DataName, Identity};
use crate::routing::{MessageId, PeerId};

#[derive(Debug, Clone)]
pub struct UnresolvedEntry<A> {
    pub owner: Identity,
    pub name: DataName,
    pub action: A,
    pub message_id: MessageId,
    pub originators: BTreeSet<PeerId>,
    created_at: Instant,
}

/// A quorum-committed action, ready to be applied to the account value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry<A> {
    pub owner: Identity,
    pub name: DataName,
    pub action: A,
    pub message_id: MessageId,
}

pub struct UnresolvedLog<A> {
    our_id: PeerId,
    quorum: usize,
    ttl: Duration,
    entries: Vec<UnresolvedEntry<A>>,
}

impl<A: Clone + Eq + std::fmt::Debug> UnresolvedLog<A> {
    pub fn new(our_id: PeerId, quorum: usize, ttl: Duration) -> Self {
        UnresolvedLog { our_id, quorum, ttl, entries: Vec::new() }
    }

    /// Record this vault's own proposal.
    pub fn add_local(
        &mut self,
        owner: Identity,
        name: DataName,
        action: A,
        message_id: MessageId,
    ) -> Option<CommittedEntry<A>> {
        let our_id = self.our_id;
        self.add(owner, name, action, message_id, our_id)
    }

    /// Merge a proposal shipped by a group peer.
    pub fn add_peer(
        &mut self,
        owner: Identity,
        name: DataName,
        action: A,
        message_id: MessageId,
        originator: PeerId,
    ) -> Option<CommittedEntry<A>> {
        self.add(owner, name, action, message_id, originator)
    }

    fn add(
        &mut self,
        owner: Identity,
        name: DataName,
        action: A,
        message_id: MessageId,
        originator: PeerId,
    ) -> Option<CommittedEntry<A>> {
        let position = self.entries.iter().position(|e| {
            e.owner == owner && e.name == name && e.message_id == message_id && e.action == action
        });
        let index = match position {
            Some(index) => {
                self.entries[index].originators.insert(originator);
                index
            }
            None => {
                self.entries.push(UnresolvedEntry {
                    owner,
                    name,
                    action,
                    message_id,
                    originators: [originator].into(),
                    created_at: Instant::now(),
                });
                self.entries.len() - 1
            }
        };
        let entry = &self.entries[index];
        if entry.originators.len() >= self.quorum && entry.originators.contains(&self.our_id) {
            let entry = self.entries.swap_remove(index);
            return Some(CommittedEntry {
                owner: entry.owner,
                name: entry.name,
                action: entry.action,
                message_id: entry.message_id,
            });
        }
        None
    }

    /// Entries this vault itself proposed, for (re)broadcast to peers.
    pub fn local_entries(&self) -> Vec<UnresolvedEntry<A>> {
        self.entries
            .iter()
            .filter(|e| e.originators.contains(&self.our_id))
            .cloned()
            .collect()
    }

    /// Drop entries past the TTL; returns how many timed out.
    pub fn prune_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|entry| {
            let keep = entry.created_at.elapsed() <= ttl;
            if !keep {
                debug!(
                    "unresolved action {:?} for {:?} timed out short of quorum ({} originators)",
                    entry.action,
                    entry.name,
                    entry.originators.len()
                );
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{DataKind, IDENTITY_SIZE};

    fn peer(fill: u8) -> PeerId {
        PeerId([fill; 64])
    }

    fn name(fill: u8) -> DataName {
        DataName::new(DataKind::ImmutableData, Identity([fill; IDENTITY_SIZE]))
    }

    fn owner(fill: u8) -> Identity {
        Identity([fill; IDENTITY_SIZE])
    }

    fn log(quorum: usize) -> UnresolvedLog<&'static str> {
        UnresolvedLog::new(peer(0), quorum, Duration::from_secs(60))
    }

    #[test]
    fn commits_at_quorum_including_self() {
        let mut log = log(3);
        assert!(log.add_local(owner(1), name(1), "put", MessageId(1)).is_none());
        assert!(log.add_peer(owner(1), name(1), "put", MessageId(1), peer(1)).is_none());
        let committed = log.add_peer(owner(1), name(1), "put", MessageId(1), peer(2));
        assert_eq!(
            committed,
            Some(CommittedEntry {
                owner: owner(1),
                name: name(1),
                action: "put",
                message_id: MessageId(1),
            })
        );
        assert!(log.is_empty());
    }

    #[test]
    fn never_commits_without_self() {
        let mut log = log(3);
        for i in 1..=5 {
            assert!(log.add_peer(owner(1), name(1), "put", MessageId(1), peer(i)).is_none());
        }
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn peer_proposals_then_local_commit() {
        let mut log = log(3);
        log.add_peer(owner(1), name(1), "put", MessageId(1), peer(1));
        log.add_peer(owner(1), name(1), "put", MessageId(1), peer(2));
        assert!(log.add_local(owner(1), name(1), "put", MessageId(1)).is_some());
    }

    #[test]
    fn repeated_originator_does_not_advance() {
        let mut log = log(3);
        log.add_local(owner(1), name(1), "put", MessageId(1));
        for _ in 0..4 {
            assert!(log.add_peer(owner(1), name(1), "put", MessageId(1), peer(1)).is_none());
        }
    }

    #[test]
    fn distinct_keys_are_independent() {
        let mut log = log(3);
        log.add_local(owner(1), name(1), "put", MessageId(1));
        log.add_local(owner(1), name(1), "put", MessageId(2));
        log.add_local(owner(1), name(1), "delete", MessageId(1));
        assert_eq!(log.len(), 3);
        assert_eq!(log.local_entries().len(), 3);
    }

    #[test]
    fn prune_drops_expired_entries() {
        let mut log = UnresolvedLog::new(peer(0), 3, Duration::from_millis(10));
        log.add_local(owner(1), name(1), "put", MessageId(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(log.prune_expired(), 1);
        assert!(log.is_empty());
    }
}
