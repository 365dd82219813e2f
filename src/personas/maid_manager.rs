//! MaidManager — the group managing one client's storage account: the
//! unit quota, registered data holders, and their health rollups.
//!
//! Client requests arrive as single-source messages; the account row
//! itself lives under the client's own name.  Successful puts are
//! forwarded to the data's DataManager group, whose response settles the
//! request (success to the client, or a quota refund on failure).

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::accumulator::{Accumulator, Fingerprint};
use crate::actions::{MaidAccountValue, MaidManagerAction, PmidRecord};
use crate::config::Config;
use crate::db::AccountDb;
use crate::error::{Result, VaultError};
use crate::name::{account_id, DataKind, DataName, MaidName, PmidName};
use crate::routing::{Destination, MessageId, PeerId, Router, SrcAuthority};
use crate::sync::broadcast_proposals;
use crate::unresolved::{CommittedEntry, UnresolvedLog};
use crate::wire::{decode_cbor, encode_cbor, Frame, Persona, Request, Response, SyncEnvelope};

use super::{admit, expect_group, expect_single, Admit};

struct ClientRequest {
    client: MaidName,
    data_name: DataName,
    content: Vec<u8>,
    client_peer: PeerId,
}

struct State {
    accumulator: Accumulator,
    unresolved: UnresolvedLog<MaidManagerAction>,
    /// In-flight client puts, keyed by message id until the DataManager
    /// group responds.
    request_cache: HashMap<MessageId, ClientRequest>,
}

pub struct MaidManager {
    db: AccountDb,
    router: Arc<dyn Router>,
    group_size: usize,
    allowance: u64,
    state: Mutex<State>,
}

type Outbound = Vec<(Destination, Vec<u8>)>;

impl MaidManager {
    pub fn new(db: AccountDb, router: Arc<dyn Router>, config: &Config) -> Self {
        let our_id = router.our_id();
        MaidManager {
            db,
            router,
            group_size: config.group_size,
            allowance: config.default_maid_allowance,
            state: Mutex::new(State {
                accumulator: Accumulator::new(config.accumulator_ttl()),
                unresolved: UnresolvedLog::new(our_id, config.quorum(), config.unresolved_ttl()),
                request_cache: HashMap::new(),
            }),
        }
    }

    /// The account row lives under the client's own name.
    fn account_row(client: &MaidName) -> DataName {
        DataName::new(DataKind::Maid, *client)
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    pub async fn handle_client_put(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        client: MaidName,
        data_name: DataName,
        content: Vec<u8>,
    ) -> Result<()> {
        expect_single(&src)?;
        let request = ClientRequest {
            client,
            data_name,
            content: content.clone(),
            client_peer: src.sender(),
        };
        let action = MaidManagerAction::Put { size: content.len() as u64 };
        self.propose(src, message_id, client, action, Some(request)).await
    }

    pub async fn handle_client_delete(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        client: MaidName,
        data_name: DataName,
    ) -> Result<()> {
        expect_single(&src)?;
        let request = ClientRequest {
            client,
            data_name,
            content: Vec::new(),
            client_peer: src.sender(),
        };
        let action = MaidManagerAction::Refund { size: 0 };
        self.propose(src, message_id, client, action, Some(request)).await
    }

    pub async fn handle_register_pmid(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        client: MaidName,
        pmid: PmidName,
    ) -> Result<()> {
        expect_single(&src)?;
        self.propose(src, message_id, client, MaidManagerAction::RegisterPmid { pmid }, None)
            .await
    }

    pub async fn handle_unregister_pmid(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        client: MaidName,
        pmid: PmidName,
    ) -> Result<()> {
        expect_single(&src)?;
        self.propose(src, message_id, client, MaidManagerAction::UnregisterPmid { pmid }, None)
            .await
    }

    /// A PmidManager group refreshed the health rollup of a holder this
    /// client registered.
    pub async fn handle_holder_health(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        client: MaidName,
        pmid: PmidName,
        record: PmidRecord,
    ) -> Result<()> {
        expect_group(&src)?;
        let action = MaidManagerAction::UpdateHolderRecord { pmid, record };
        self.propose(src, message_id, client, action, None).await
    }

    /// Read: account usage, answered directly from the committed row.
    pub async fn handle_get_account_info(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        client: MaidName,
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

        let response = match self.read_value(&client).await? {
            Some(account) => Response::AccountInfo {
                data_stored: account.data_stored,
                space_available: account.space_available,
            },
            None => Response::Failure { error: VaultError::NotFound },
        };
        let bytes = self.response_frame(client, message_id, response)?;
        {
            let mut state = self.state.lock().await;
            state
                .accumulator
                .set_handled(Fingerprint::new(message_id, &src), Some(bytes.clone()));
        }
        self.router.send(Destination::Peer(requester), bytes);
        Ok(())
    }

    /// The DataManager group settled a forwarded put.
    pub async fn handle_put_response(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        response: Response,
    ) -> Result<()> {
        expect_group(&src)?;
        let mut outbound = Outbound::new();
        let proposals = {
            let mut state = self.state.lock().await;
            match admit(&mut state.accumulator, &src, message_id, self.group_size) {
                Admit::Admitted => {}
                Admit::Pending => return Ok(()),
                Admit::AlreadyHandled(_) => return Err(VaultError::DuplicateRequest),
            }
            let Some(request) = state.request_cache.remove(&message_id) else {
                warn!("response for unknown request {message_id:?}");
                return Ok(());
            };
            let mut response = response;
            if let Response::PutFailure { error, .. } = &response {
                info!("put of {:?} failed downstream: {error}", request.data_name);
                // Give the unit back, through the same quorum pipeline as
                // the charge.
                let refund =
                    MaidManagerAction::Refund { size: request.content.len() as u64 };
                if let Some(entry) = state.unresolved.add_local(
                    request.client,
                    Self::account_row(&request.client),
                    refund,
                    message_id,
                ) {
                    self.apply_committed(&mut state, entry, &mut outbound).await?;
                }
                // A duplicate identity packet means the account was already
                // created through another client manager.
                if *error == VaultError::DuplicateData && request.data_name.kind.is_unique() {
                    response = Response::PutFailure {
                        name: request.data_name,
                        error: VaultError::AccountExists,
                    };
                }
            }
            let bytes = self.response_frame(request.client, message_id, response)?;
            outbound.push((Destination::Peer(request.client_peer), bytes));
            state.unresolved.local_entries()
        };
        if !proposals.is_empty() {
            broadcast_proposals(self.router.as_ref(), Persona::MaidManager, &proposals)?;
        }
        self.flush(outbound);
        Ok(())
    }

    pub async fn handle_sync(&self, entries: Vec<SyncEnvelope>) -> Result<()> {
        let mut outbound = Outbound::new();
        {
            let mut state = self.state.lock().await;
            let mut committed = Vec::new();
            for envelope in entries {
                let action: MaidManagerAction = match decode_cbor(&envelope.action) {
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
            broadcast_proposals(self.router.as_ref(), Persona::MaidManager, &proposals)?;
        }
        Ok(())
    }

    // ── Pipeline internals ───────────────────────────────────────────────────

    async fn propose(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        client: MaidName,
        action: MaidManagerAction,
        request: Option<ClientRequest>,
    ) -> Result<()> {
        let mut outbound = Outbound::new();
        let proposals = {
            let mut state = self.state.lock().await;
            match admit(&mut state.accumulator, &src, message_id, self.group_size) {
                Admit::Admitted => {}
                Admit::Pending => return Ok(()),
                Admit::AlreadyHandled(_) => return Err(VaultError::DuplicateRequest),
            }
            if let Some(request) = request {
                state.request_cache.insert(message_id, request);
            }
            if let Some(entry) = state.unresolved.add_local(
                client,
                Self::account_row(&client),
                action,
                message_id,
            ) {
                self.apply_committed(&mut state, entry, &mut outbound).await?;
            }
            state.unresolved.local_entries()
        };
        if !proposals.is_empty() {
            broadcast_proposals(self.router.as_ref(), Persona::MaidManager, &proposals)?;
        }
        self.flush(outbound);
        Ok(())
    }

    async fn read_value(&self, client: &MaidName) -> Result<Option<MaidAccountValue>> {
        let account = account_id(Persona::MaidManager.account_prefix(), client);
        match self.db.get(&account, &Self::account_row(client).encode()).await {
            Ok(bytes) => Ok(Some(decode_cbor(&bytes)?)),
            Err(VaultError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply_committed(
        &self,
        state: &mut State,
        entry: CommittedEntry<MaidManagerAction>,
        outbound: &mut Outbound,
    ) -> Result<()> {
        let account = account_id(Persona::MaidManager.account_prefix(), &entry.owner);
        let key = entry.name.encode();
        let mut value = self.read_value(&entry.owner).await?;

        if let Err(error) = entry.action.apply(&mut value, self.allowance) {
            info!("account action for {:?} failed: {error}", entry.owner);
            if let Some(request) = state.request_cache.remove(&entry.message_id) {
                let response =
                    Response::PutFailure { name: request.data_name, error };
                let bytes = self.response_frame(entry.owner, entry.message_id, response)?;
                outbound.push((Destination::Peer(request.client_peer), bytes));
            }
            return Ok(());
        }

        match &value {
            Some(value) => self.db.put(&account, &key, &encode_cbor(value)?).await?,
            None => self.db.delete(&account, &key).await?,
        }

        // The charge stuck; now move the data itself along.
        match &entry.action {
            MaidManagerAction::Put { .. } => {
                if let Some(request) = state.request_cache.get(&entry.message_id) {
                    let frame = Frame::Request {
                        persona: Persona::DataManager,
                        src: SrcAuthority::Group {
                            group: request.client,
                            peer: self.router.our_id(),
                        },
                        message_id: entry.message_id,
                        request: Request::Put {
                            name: request.data_name,
                            content: request.content.clone(),
                        },
                    };
                    outbound.push((
                        Destination::Group(request.data_name.identity),
                        frame.to_bytes()?,
                    ));
                }
            }
            MaidManagerAction::Refund { .. } => {
                // A client delete forwards to the DataManager group; a
                // failure refund does not (nothing was stored).
                if let Some(request) = state.request_cache.remove(&entry.message_id) {
                    if request.content.is_empty() {
                        let frame = Frame::Request {
                            persona: Persona::DataManager,
                            src: SrcAuthority::Group {
                                group: request.client,
                                peer: self.router.our_id(),
                            },
                            message_id: entry.message_id,
                            request: Request::Delete { name: request.data_name },
                        };
                        outbound.push((
                            Destination::Group(request.data_name.identity),
                            frame.to_bytes()?,
                        ));
                    }
                }
            }
            MaidManagerAction::RegisterPmid { pmid } => {
                info!("client {:?} registered holder {:?}", entry.owner, pmid);
            }
            MaidManagerAction::UnregisterPmid { .. }
            | MaidManagerAction::UpdateHolderRecord { .. } => {}
        }
        Ok(())
    }

    fn response_frame(
        &self,
        client: MaidName,
        message_id: MessageId,
        response: Response,
    ) -> Result<Vec<u8>> {
        Frame::Response {
            src: SrcAuthority::Group { group: client, peer: self.router.our_id() },
            message_id,
            response,
        }
        .to_bytes()
    }

    fn flush(&self, outbound: Outbound) {
        for (dst, bytes) in outbound {
            self.router.send(dst, bytes);
        }
    }
}
