//! Request accumulator — deduplication and sender-side quorum gating.
//!
//! Every inbound request is keyed by `(message_id, source)` where the
//! source of a group message is the group itself, not the individual
//! member.  A single-source request is admitted on first sight; a
//! group-source request only once `group_size - 1` distinct members have
//! sent the identical message.  After a request is handled its entry
//! lingers for one TTL to suppress late retries, optionally replaying a
//! cached reply.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::name::Identity;
use crate::routing::{MessageId, PeerId, SrcAuthority};

/// Default LRU cap on live entries per persona.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SrcKey {
    Single(PeerId),
    Group(Identity),
}

/// Identity of a request, shared by all copies of a group message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    message_id: MessageId,
    src: SrcKey,
}

impl Fingerprint {
    pub fn new(message_id: MessageId, src: &SrcAuthority) -> Self {
        let src = match src {
            SrcAuthority::Single { peer } => SrcKey::Single(*peer),
            SrcAuthority::Group { group, .. } => SrcKey::Group(*group),
        };
        Fingerprint { message_id, src }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddResult {
    /// Quorum met right now; the caller owns the request from here.
    Success,
    /// Counted, still short of quorum.
    Waiting,
    /// Already handled.
    Duplicate,
    /// Sender already counted; no progress.
    Rejected,
}

struct Entry {
    handled: bool,
    pending: BTreeSet<PeerId>,
    reply: Option<Vec<u8>>,
    touched: Instant,
}

pub struct Accumulator {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<Fingerprint, Entry>,
    order: VecDeque<Fingerprint>,
}

impl Accumulator {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Accumulator { ttl, capacity, entries: HashMap::new(), order: VecDeque::new() }
    }

    pub fn check_handled(&mut self, fingerprint: &Fingerprint) -> bool {
        self.prune();
        self.entries.get(fingerprint).map(|e| e.handled).unwrap_or(false)
    }

    /// Count `sender` toward the request's quorum of `required` distinct
    /// senders.
    pub fn add_pending(
        &mut self,
        fingerprint: Fingerprint,
        sender: PeerId,
        required: usize,
    ) -> AddResult {
        self.prune();
        if !self.entries.contains_key(&fingerprint) {
            self.evict_for_capacity();
            self.entries.insert(
                fingerprint,
                Entry {
                    handled: false,
                    pending: BTreeSet::new(),
                    reply: None,
                    touched: Instant::now(),
                },
            );
            self.order.push_back(fingerprint);
        }
        let entry = self.entries.get_mut(&fingerprint).expect("just inserted");
        if entry.handled {
            return AddResult::Duplicate;
        }
        if !entry.pending.insert(sender) {
            return AddResult::Rejected;
        }
        entry.touched = Instant::now();
        if entry.pending.len() >= required {
            AddResult::Success
        } else {
            AddResult::Waiting
        }
    }

    /// Mark handled, optionally caching the reply for replay to late
    /// retries.
    pub fn set_handled(&mut self, fingerprint: Fingerprint, reply: Option<Vec<u8>>) {
        let entry = self.entries.entry(fingerprint).or_insert_with(|| Entry {
            handled: false,
            pending: BTreeSet::new(),
            reply: None,
            touched: Instant::now(),
        });
        entry.handled = true;
        entry.reply = reply;
        entry.pending.clear();
        entry.touched = Instant::now();
    }

    pub fn cached_reply(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        self.entries.get(fingerprint).and_then(|e| e.reply.clone())
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.touched.elapsed() <= ttl);
        let entries = &self.entries;
        self.order.retain(|fp| entries.contains_key(fp));
    }

    /// Evict the oldest unhandled entry once the cap is reached; if every
    /// entry is handled, the oldest overall goes.
    fn evict_for_capacity(&mut self) {
        if self.entries.len() < self.capacity {
            return;
        }
        let victim = self
            .order
            .iter()
            .find(|fp| self.entries.get(*fp).map(|e| !e.handled).unwrap_or(false))
            .or_else(|| self.order.front())
            .copied();
        if let Some(fp) = victim {
            self.entries.remove(&fp);
            self.order.retain(|f| *f != fp);
        }
    }
}
