//! VersionManager — the group maintaining the version graph of mutable,
//! version-managed data.
//!
//! Reads are serialized through the same quorum pipeline as writes so
//! every answer reflects a committed prefix of the graph's history.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::accumulator::Accumulator;
use crate::actions::{VersionManagerAction, VersionOutcome};
use crate::config::Config;
use crate::db::AccountDb;
use crate::error::{Result, VaultError};
use crate::name::{account_id, DataName};
use crate::routing::{Destination, MessageId, PeerId, Router, SrcAuthority};
use crate::sync::broadcast_proposals;
use crate::unresolved::{CommittedEntry, UnresolvedLog};
use crate::versions::{StructuredDataVersions, VersionName};
use crate::wire::{decode_cbor, encode_cbor, Frame, Persona, SyncEnvelope, Response};

use super::{admit, expect_single, Admit};

struct State {
    accumulator: Accumulator,
    unresolved: UnresolvedLog<VersionManagerAction>,
    /// Requester to answer once the action commits.
    reply_cache: HashMap<MessageId, PeerId>,
}

pub struct VersionManager {
    db: AccountDb,
    router: Arc<dyn Router>,
    group_size: usize,
    max_versions: usize,
    max_branches: usize,
    state: Mutex<State>,
}

type Outbound = Vec<(Destination, Vec<u8>)>;

impl VersionManager {
    pub fn new(db: AccountDb, router: Arc<dyn Router>, config: &Config) -> Self {
        let our_id = router.our_id();
        VersionManager {
            db,
            router,
            group_size: config.group_size,
            max_versions: config.max_versions,
            max_branches: config.max_branches,
            state: Mutex::new(State {
                accumulator: Accumulator::new(config.accumulator_ttl()),
                unresolved: UnresolvedLog::new(our_id, config.quorum(), config.unresolved_ttl()),
                reply_cache: HashMap::new(),
            }),
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    pub async fn handle_put_version(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        old: Option<VersionName>,
        new: VersionName,
    ) -> Result<()> {
        self.propose(src, message_id, name, VersionManagerAction::PutVersion { old, new })
            .await
    }

    pub async fn handle_get_versions(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
    ) -> Result<()> {
        self.propose(src, message_id, name, VersionManagerAction::GetVersions).await
    }

    pub async fn handle_get_branch(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        tip: VersionName,
    ) -> Result<()> {
        self.propose(src, message_id, name, VersionManagerAction::GetBranch { tip }).await
    }

    pub async fn handle_delete_branch(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        tip: VersionName,
    ) -> Result<()> {
        self.propose(src, message_id, name, VersionManagerAction::DeleteBranchUntilFork { tip })
            .await
    }

    pub async fn handle_sync(&self, entries: Vec<SyncEnvelope>) -> Result<()> {
        let mut outbound = Outbound::new();
        {
            let mut state = self.state.lock().await;
            let mut committed = Vec::new();
            for envelope in entries {
                let action: VersionManagerAction = match decode_cbor(&envelope.action) {
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
            broadcast_proposals(self.router.as_ref(), Persona::VersionManager, &proposals)?;
        }
        Ok(())
    }

    // ── Pipeline internals ───────────────────────────────────────────────────

    async fn propose(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        action: VersionManagerAction,
    ) -> Result<()> {
        expect_single(&src)?;
        let mut outbound = Outbound::new();
        let proposals = {
            let mut state = self.state.lock().await;
            match admit(&mut state.accumulator, &src, message_id, self.group_size) {
                Admit::Admitted => {}
                Admit::Pending => return Ok(()),
                Admit::AlreadyHandled(reply) => {
                    if let Some(bytes) = reply {
                        self.router.send(Destination::Peer(src.sender()), bytes);
                    }
                    return Err(VaultError::DuplicateRequest);
                }
            }
            state.reply_cache.insert(message_id, src.sender());
            if let Some(entry) =
                state.unresolved.add_local(name.identity, name, action, message_id)
            {
                self.apply_committed(&mut state, entry, &mut outbound).await?;
            }
            state.unresolved.local_entries()
        };
        if !proposals.is_empty() {
            broadcast_proposals(self.router.as_ref(), Persona::VersionManager, &proposals)?;
        }
        self.flush(outbound);
        Ok(())
    }

    async fn apply_committed(
        &self,
        state: &mut State,
        entry: CommittedEntry<VersionManagerAction>,
        outbound: &mut Outbound,
    ) -> Result<()> {
        let account = account_id(Persona::VersionManager.account_prefix(), &entry.owner);
        let key = entry.name.encode();
        let mut value: Option<StructuredDataVersions> = match self.db.get(&account, &key).await {
            Ok(bytes) => Some(decode_cbor(&bytes)?),
            Err(VaultError::NotFound) => None,
            Err(e) => return Err(e),
        };

        let response = match entry.action.apply(&mut value, self.max_versions, self.max_branches)
        {
            Ok(outcome) => {
                match &value {
                    Some(value) => self.db.put(&account, &key, &encode_cbor(value)?).await?,
                    None => self.db.delete(&account, &key).await?,
                }
                match outcome {
                    VersionOutcome::Applied | VersionOutcome::Removed => {
                        Response::PutSuccess { name: entry.name }
                    }
                    VersionOutcome::Tips(names) => Response::Versions { names },
                    VersionOutcome::Branch(names) => Response::Branch { names },
                }
            }
            Err(error) => {
                info!("version action on {:?} failed: {error}", entry.name);
                Response::PutFailure { name: entry.name, error }
            }
        };

        if let Some(requester) = state.reply_cache.remove(&entry.message_id) {
            let frame = Frame::Response {
                src: SrcAuthority::Group {
                    group: entry.name.identity,
                    peer: self.router.our_id(),
                },
                message_id: entry.message_id,
                response,
            };
            outbound.push((Destination::Peer(requester), frame.to_bytes()?));
        }
        Ok(())
    }

    fn flush(&self, outbound: Outbound) {
        for (dst, bytes) in outbound {
            self.router.send(dst, bytes);
        }
    }
}
