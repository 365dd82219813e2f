//! PmidManager — the group closest to a data-holding vault, keeping the
//! rollup of what that holder stores and how much space it claims.
//!
//! Store/delete instructions arrive from DataManager groups and, once
//! committed, are relayed to the holder itself.  The holder reports its
//! own claimed free space as a single-source message.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::accumulator::Accumulator;
use crate::actions::{PmidAccountValue, PmidManagerAction};
use crate::config::Config;
use crate::db::AccountDb;
use crate::error::{Result, VaultError};
use crate::name::{account_id, DataKind, DataName, Identity, PmidName};
use crate::routing::{Destination, MessageId, PeerId, Router, SrcAuthority};
use crate::sync::broadcast_proposals;
use crate::unresolved::{CommittedEntry, UnresolvedLog};
use crate::wire::{decode_cbor, encode_cbor, Frame, Persona, Request, SyncEnvelope};

use super::{admit, expect_group, expect_single, Admit};

struct State {
    accumulator: Accumulator,
    unresolved: UnresolvedLog<PmidManagerAction>,
    /// Chunk bytes held until the store instruction commits.
    content_cache: HashMap<MessageId, Vec<u8>>,
}

pub struct PmidManager {
    db: AccountDb,
    router: Arc<dyn Router>,
    group_size: usize,
    state: Mutex<State>,
}

type Outbound = Vec<(Destination, Vec<u8>)>;

impl PmidManager {
    pub fn new(db: AccountDb, router: Arc<dyn Router>, config: &Config) -> Self {
        let our_id = router.our_id();
        PmidManager {
            db,
            router,
            group_size: config.group_size,
            state: Mutex::new(State {
                accumulator: Accumulator::new(config.accumulator_ttl()),
                unresolved: UnresolvedLog::new(our_id, config.quorum(), config.unresolved_ttl()),
                content_cache: HashMap::new(),
            }),
        }
    }

    /// The rollup row lives under the holder's own name.
    fn account_row(holder: &PmidName) -> DataName {
        DataName::new(DataKind::Pmid, *holder)
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    pub async fn handle_forward_put(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        holder: PmidName,
        name: DataName,
        content: Vec<u8>,
    ) -> Result<()> {
        expect_group(&src)?;
        let action = PmidManagerAction::Put { size: content.len() as u64 };
        self.propose(src, message_id, holder, name, action, Some(content)).await
    }

    pub async fn handle_forward_delete(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        holder: PmidName,
        name: DataName,
        size: u64,
    ) -> Result<()> {
        expect_group(&src)?;
        self.propose(src, message_id, holder, name, PmidManagerAction::Delete { size }, None)
            .await
    }

    /// The holder reported a failed chunk store: count the chunk lost and
    /// tell the data's managers the holder is down for it.
    pub async fn handle_node_put_failure(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
    ) -> Result<()> {
        expect_single(&src)?;
        let holder = Identity::from(src.sender());
        self.propose(src, message_id, holder, name, PmidManagerAction::MarkLost { size: 0 }, None)
            .await
    }

    /// The holder itself reports how much space it still offers.
    pub async fn handle_update_health(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        holder: PmidName,
        available_size: u64,
    ) -> Result<()> {
        expect_single(&src)?;
        if src.sender() != PeerId::from(holder) {
            warn!("health report for {:?} from a different peer", holder);
            return Err(VaultError::UnauthorizedSender);
        }
        let action = PmidManagerAction::UpdateHealth { available_size };
        self.propose(src, message_id, holder, Self::account_row(&holder), action, None).await
    }

    pub async fn handle_sync(&self, entries: Vec<SyncEnvelope>) -> Result<()> {
        let mut outbound = Outbound::new();
        {
            let mut state = self.state.lock().await;
            let mut committed = Vec::new();
            for envelope in entries {
                let action: PmidManagerAction = match decode_cbor(&envelope.action) {
                    Ok(action) => action,
                    Err(_) => {
                        warn!("dropping malformed sync entry for {:?}", envelope.name);
                        continue;
                    }
                };
                if let Some(entry) = state.unresolved.add_peer(
                    envelope.owner,
                    envelope.name,
                    action,
                    envelope.message_id,
                    envelope.originator,
                ) {
                    committed.push(entry);
                }
            }
            committed.sort_by_key(|entry| entry.message_id);
            for entry in committed {
                self.apply_committed(&mut state, entry, &mut outbound).await?;
            }
        }
        self.flush(outbound);
        Ok(())
    }

    pub async fn maintain(&self) -> Result<()> {
        let proposals = {
            let mut state = self.state.lock().await;
            state.unresolved.prune_expired();
            state.unresolved.local_entries()
        };
        if !proposals.is_empty() {
            broadcast_proposals(self.router.as_ref(), Persona::PmidManager, &proposals)?;
        }
        Ok(())
    }

    // ── Pipeline internals ───────────────────────────────────────────────────

    async fn propose(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        holder: PmidName,
        name: DataName,
        action: PmidManagerAction,
        content: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut outbound = Outbound::new();
        let proposals = {
            let mut state = self.state.lock().await;
            match admit(&mut state.accumulator, &src, message_id, self.group_size) {
                Admit::Admitted => {}
                Admit::Pending => return Ok(()),
                Admit::AlreadyHandled(_) => return Err(VaultError::DuplicateRequest),
            }
            if let Some(content) = content {
                state.content_cache.insert(message_id, content);
            }
            if let Some(entry) = state.unresolved.add_local(holder, name, action, message_id) {
                self.apply_committed(&mut state, entry, &mut outbound).await?;
            }
            state.unresolved.local_entries()
        };
        if !proposals.is_empty() {
            broadcast_proposals(self.router.as_ref(), Persona::PmidManager, &proposals)?;
        }
        self.flush(outbound);
        Ok(())
    }

    async fn apply_committed(
        &self,
        state: &mut State,
        entry: CommittedEntry<PmidManagerAction>,
        outbound: &mut Outbound,
    ) -> Result<()> {
        let account = account_id(Persona::PmidManager.account_prefix(), &entry.owner);
        let key = Self::account_row(&entry.owner).encode();
        let mut value: Option<PmidAccountValue> = match self.db.get(&account, &key).await {
            Ok(bytes) => Some(decode_cbor(&bytes)?),
            Err(VaultError::NotFound) => None,
            Err(e) => return Err(e),
        };

        if let Err(error) = entry.action.apply(&mut value) {
            info!("rollup action for holder {:?} failed: {error}", entry.owner);
            return Ok(());
        }
        match &value {
            Some(value) => self.db.put(&account, &key, &encode_cbor(value)?).await?,
            None => self.db.delete(&account, &key).await?,
        }

        // Relay the committed instruction to the holder.
        let node = Destination::Peer(PeerId::from(entry.owner));
        let src = SrcAuthority::Group { group: entry.owner, peer: self.router.our_id() };
        match entry.action {
            PmidManagerAction::Put { .. } => {
                if let Some(content) = state.content_cache.remove(&entry.message_id) {
                    let frame = Frame::Request {
                        persona: Persona::PmidNode,
                        src,
                        message_id: entry.message_id,
                        request: Request::ChunkPut { name: entry.name, content },
                    };
                    outbound.push((node, frame.to_bytes()?));
                }
            }
            PmidManagerAction::Delete { .. } => {
                let frame = Frame::Request {
                    persona: Persona::PmidNode,
                    src,
                    message_id: entry.message_id,
                    request: Request::ChunkDelete { name: entry.name },
                };
                outbound.push((node, frame.to_bytes()?));
            }
            PmidManagerAction::MarkLost { .. } => {
                // The holder lost this chunk; its DataManager group moves
                // the holder offline and re-replicates as needed.
                let frame = Frame::Request {
                    persona: Persona::DataManager,
                    src,
                    message_id: entry.message_id,
                    request: Request::HolderDown { name: entry.name, pmid: entry.owner },
                };
                outbound.push((Destination::Group(entry.name.identity), frame.to_bytes()?));
            }
            PmidManagerAction::UpdateHealth { .. } => {}
        }
        Ok(())
    }

    fn flush(&self, outbound: Outbound) {
        for (dst, bytes) in outbound {
            self.router.send(dst, bytes);
        }
    }
}
