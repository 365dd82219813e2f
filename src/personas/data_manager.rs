//! DataManager — the group responsible for a data element's metadata:
//! who holds replicas, how many clients reference it, and whether the
//! holders are healthy.
//!
//! Mutations arrive from the owning MaidManager group (puts/deletes) or
//! the holders' PmidManager groups (health transitions), pass the
//! accumulator, and are proposed to the unresolved log.  Commits run
//! under the persona mutex; router traffic goes out after it is
//! released.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::accumulator::{Accumulator, Fingerprint};
use crate::actions::{DataAccountValue, DataManagerAction, DataOutcome};
use crate::config::Config;
use crate::db::AccountDb;
use crate::error::{Result, VaultError};
use crate::name::{account_id, DataName, Identity, PmidName};
use crate::routing::{Destination, MessageId, PeerId, Router, SrcAuthority};
use crate::sync::broadcast_proposals;
use crate::unresolved::{CommittedEntry, UnresolvedLog};
use crate::wire::{decode_cbor, encode_cbor, Frame, Persona, Request, Response, SyncEnvelope};

use super::{admit, expect_group, expect_single, Admit};

/// Request context needed once the proposed action commits.
struct PendingRequest {
    content: Vec<u8>,
    /// Close group to answer (the client's MaidManager group).
    reply_group: Identity,
}

struct State {
    accumulator: Accumulator,
    unresolved: UnresolvedLog<DataManagerAction>,
    pending: HashMap<MessageId, PendingRequest>,
}

pub struct DataManager {
    db: AccountDb,
    router: Arc<dyn Router>,
    group_size: usize,
    min_holders: usize,
    state: Mutex<State>,
}

type Outbound = Vec<(Destination, Vec<u8>)>;

impl DataManager {
    pub fn new(db: AccountDb, router: Arc<dyn Router>, config: &Config) -> Self {
        let our_id = router.our_id();
        DataManager {
            db,
            router,
            group_size: config.group_size,
            min_holders: config.min_holders,
            state: Mutex::new(State {
                accumulator: Accumulator::new(config.accumulator_ttl()),
                unresolved: UnresolvedLog::new(our_id, config.quorum(), config.unresolved_ttl()),
                pending: HashMap::new(),
            }),
        }
    }

    fn account(&self, owner: &Identity) -> String {
        account_id(Persona::DataManager.account_prefix(), owner)
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    pub async fn handle_put(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        content: Vec<u8>,
    ) -> Result<()> {
        expect_group(&src)?;
        let reply_group = match src {
            SrcAuthority::Group { group, .. } => group,
            SrcAuthority::Single { .. } => unreachable!("checked above"),
        };
        let action = DataManagerAction::Put {
            size: content.len() as u64,
            unique: name.kind.is_unique(),
        };
        self.propose(src, message_id, name, action, Some(PendingRequest { content, reply_group }))
            .await
    }

    pub async fn handle_delete(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
    ) -> Result<()> {
        expect_group(&src)?;
        self.propose(src, message_id, name, DataManagerAction::Delete, None).await
    }

    pub async fn handle_holder_down(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        pmid: PmidName,
    ) -> Result<()> {
        expect_group(&src)?;
        self.propose(src, message_id, name, DataManagerAction::MarkHolderDown { pmid }, None)
            .await
    }

    pub async fn handle_holder_up(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        pmid: PmidName,
    ) -> Result<()> {
        expect_group(&src)?;
        self.propose(src, message_id, name, DataManagerAction::MarkHolderUp { pmid }, None).await
    }

    /// Read: reply with the current online holders so the caller can
    /// fetch the chunk from one of them.
    pub async fn handle_get(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
    ) -> Result<()> {
        expect_single(&src)?;
        let requester = src.sender();
        {
            let mut state = self.state.lock().await;
            match admit(&mut state.accumulator, &src, message_id, self.group_size) {
                Admit::Admitted => {}
                Admit::Pending => return Ok(()),
                Admit::AlreadyHandled(reply) => {
                    if let Some(bytes) = reply {
                        self.router.send(Destination::Peer(requester), bytes);
                    }
                    return Err(VaultError::DuplicateRequest);
                }
            }
        }

        let response = match self.read_value(&name).await? {
            Some(value) => Response::Holders {
                name,
                holders: value.online_holders.iter().copied().collect(),
            },
            None => Response::Failure { error: VaultError::NotFound },
        };
        let bytes = self.response_frame(name, message_id, response)?;
        {
            let mut state = self.state.lock().await;
            let fingerprint = Fingerprint::new(message_id, &src);
            state.accumulator.set_handled(fingerprint, Some(bytes.clone()));
        }
        self.router.send(Destination::Peer(requester), bytes);
        Ok(())
    }

    /// Ingest a peer's sync broadcast.
    pub async fn handle_sync(&self, entries: Vec<SyncEnvelope>) -> Result<()> {
        let mut outbound = Outbound::new();
        {
            let mut state = self.state.lock().await;
            let mut committed = Vec::new();
            for envelope in entries {
                let action: DataManagerAction = match decode_cbor(&envelope.action) {
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
            // Concurrent actions on one key resolve in message-id order.
            committed.sort_by_key(|entry| entry.message_id);
            for entry in committed {
                self.apply_committed(&mut state, entry, &mut outbound).await?;
            }
        }
        self.flush(outbound);
        Ok(())
    }

    /// Drop aged pipeline state and rebroadcast what is still pending.
    pub async fn maintain(&self) -> Result<()> {
        let proposals = {
            let mut state = self.state.lock().await;
            state.unresolved.prune_expired();
            state.unresolved.local_entries()
        };
        if !proposals.is_empty() {
            broadcast_proposals(self.router.as_ref(), Persona::DataManager, &proposals)?;
        }
        Ok(())
    }

    // ── Pipeline internals ───────────────────────────────────────────────────

    async fn propose(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        action: DataManagerAction,
        pending: Option<PendingRequest>,
    ) -> Result<()> {
        let mut outbound = Outbound::new();
        let proposals = {
            let mut state = self.state.lock().await;
            match admit(&mut state.accumulator, &src, message_id, self.group_size) {
                Admit::Admitted => {}
                Admit::Pending => return Ok(()),
                Admit::AlreadyHandled(_) => return Err(VaultError::DuplicateRequest),
            }
            if let Some(pending) = pending {
                state.pending.insert(message_id, pending);
            }
            if let Some(entry) =
                state.unresolved.add_local(name.identity, name, action, message_id)
            {
                self.apply_committed(&mut state, entry, &mut outbound).await?;
            }
            state.unresolved.local_entries()
        };
        if !proposals.is_empty() {
            broadcast_proposals(self.router.as_ref(), Persona::DataManager, &proposals)?;
        }
        self.flush(outbound);
        Ok(())
    }

    async fn read_value(&self, name: &DataName) -> Result<Option<DataAccountValue>> {
        let account = self.account(&name.identity);
        match self.db.get(&account, &name.encode()).await {
            Ok(bytes) => Ok(Some(decode_cbor(&bytes)?)),
            Err(VaultError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Apply one committed action to the account row.  Runs under the
    /// persona mutex: commits into any one account are single-writer.
    async fn apply_committed(
        &self,
        state: &mut State,
        entry: CommittedEntry<DataManagerAction>,
        outbound: &mut Outbound,
    ) -> Result<()> {
        let account = self.account(&entry.owner);
        let key = entry.name.encode();
        let mut value = self.read_value(&entry.name).await?;

        let outcome = match entry.action.apply(&mut value) {
            Ok(outcome) => outcome,
            Err(error) => {
                info!("action on {:?} failed: {error}", entry.name);
                if let Some(pending) = state.pending.remove(&entry.message_id) {
                    let response = Response::PutFailure { name: entry.name, error };
                    let bytes = self.response_frame(entry.name, entry.message_id, response)?;
                    outbound.push((Destination::Group(pending.reply_group), bytes));
                }
                return Ok(());
            }
        };

        // Fresh rows get their replica holders here: the close group of
        // the data name, identically derived on every replica.
        if outcome == DataOutcome::Created {
            if let Some(ref mut created) = value {
                created.online_holders = self
                    .router
                    .close_group(&entry.name.identity)
                    .into_iter()
                    .map(Identity::from)
                    .collect();
            }
        }

        match &value {
            Some(value) => self.db.put(&account, &key, &encode_cbor(value)?).await?,
            None => self.db.delete(&account, &key).await?,
        }

        self.react(state, &entry, outcome, &value, outbound)
    }

    /// Emit the downstream traffic a committed action calls for.
    fn react(
        &self,
        state: &mut State,
        entry: &CommittedEntry<DataManagerAction>,
        outcome: DataOutcome,
        value: &Option<DataAccountValue>,
        outbound: &mut Outbound,
    ) -> Result<()> {
        let name = entry.name;
        match outcome {
            DataOutcome::Created => {
                let pending = state.pending.remove(&entry.message_id);
                let Some(pending) = pending else {
                    // Committed purely from peer proposals before our copy
                    // of the request arrived; peers forward the data.
                    return Ok(());
                };
                if let Some(value) = value {
                    for holder in &value.online_holders {
                        let request = Request::ForwardPut {
                            holder: *holder,
                            name,
                            content: pending.content.clone(),
                        };
                        outbound.push((
                            Destination::Group(*holder),
                            self.group_request_frame(
                                Persona::PmidManager,
                                name.identity,
                                entry.message_id,
                                request,
                            )?,
                        ));
                    }
                }
                let bytes = self.response_frame(
                    name,
                    entry.message_id,
                    Response::PutSuccess { name },
                )?;
                outbound.push((Destination::Group(pending.reply_group), bytes));
            }
            DataOutcome::Subscribed { .. } => {
                if let Some(pending) = state.pending.remove(&entry.message_id) {
                    let bytes = self.response_frame(
                        name,
                        entry.message_id,
                        Response::PutSuccess { name },
                    )?;
                    outbound.push((Destination::Group(pending.reply_group), bytes));
                }
            }
            DataOutcome::Removed { holders, size } => {
                for holder in holders {
                    let request = Request::ForwardDelete { holder, name, size };
                    outbound.push((
                        Destination::Group(holder),
                        self.group_request_frame(
                            Persona::PmidManager,
                            name.identity,
                            entry.message_id,
                            request,
                        )?,
                    ));
                }
            }
            DataOutcome::RemainingOnline(remaining) => {
                if remaining < self.min_holders {
                    info!(
                        "data {:?} down to {remaining} online holders, fetching for re-replication",
                        name
                    );
                    if let Some(value) = value {
                        for holder in &value.online_holders {
                            let request = Request::ChunkGet { name };
                            outbound.push((
                                Destination::Peer(PeerId::from(*holder)),
                                self.single_request_frame(
                                    Persona::PmidNode,
                                    entry.message_id,
                                    request,
                                )?,
                            ));
                        }
                    }
                }
            }
            DataOutcome::Unsubscribed { .. } | DataOutcome::Applied => {}
        }
        Ok(())
    }

    // ── Frame builders ───────────────────────────────────────────────────────

    fn response_frame(
        &self,
        name: DataName,
        message_id: MessageId,
        response: Response,
    ) -> Result<Vec<u8>> {
        Frame::Response {
            src: SrcAuthority::Group { group: name.identity, peer: self.router.our_id() },
            message_id,
            response,
        }
        .to_bytes()
    }

    fn group_request_frame(
        &self,
        persona: Persona,
        group: Identity,
        message_id: MessageId,
        request: Request,
    ) -> Result<Vec<u8>> {
        Frame::Request {
            persona,
            src: SrcAuthority::Group { group, peer: self.router.our_id() },
            message_id,
            request,
        }
        .to_bytes()
    }

    fn single_request_frame(
        &self,
        persona: Persona,
        message_id: MessageId,
        request: Request,
    ) -> Result<Vec<u8>> {
        Frame::Request {
            persona,
            src: SrcAuthority::Single { peer: self.router.our_id() },
            message_id,
            request,
        }
        .to_bytes()
    }

    fn flush(&self, outbound: Outbound) {
        for (dst, bytes) in outbound {
            self.router.send(dst, bytes);
        }
    }
}
