//! Demultiplexer — turns an opaque routed byte-string into a call on the
//! right persona handler.
//!
//! Stateless: it parses the frame, checks the persona tag against the
//! request kind, and hands over.  Malformed bytes are dropped without
//! logging (they are indistinguishable from noise); a persona tag that
//! does not accept the request kind is dropped with a warning.

use std::sync::Arc;

use log::warn;

use crate::error::{Result, VaultError};
use crate::personas::{DataManager, MaidManager, PmidManager, PmidNode, VersionManager};
use crate::sync::TransferCoordinator;
use crate::wire::{Frame, Persona, Request, Response};

pub struct Demultiplexer {
    maid_manager: Arc<MaidManager>,
    data_manager: Arc<DataManager>,
    pmid_manager: Arc<PmidManager>,
    version_manager: Arc<VersionManager>,
    pmid_node: Arc<PmidNode>,
    transfers: Arc<TransferCoordinator>,
}

impl Demultiplexer {
    pub fn new(
        maid_manager: Arc<MaidManager>,
        data_manager: Arc<DataManager>,
        pmid_manager: Arc<PmidManager>,
        version_manager: Arc<VersionManager>,
        pmid_node: Arc<PmidNode>,
        transfers: Arc<TransferCoordinator>,
    ) -> Self {
        Demultiplexer {
            maid_manager,
            data_manager,
            pmid_manager,
            version_manager,
            pmid_node,
            transfers,
        }
    }

    pub async fn handle_message(&self, bytes: &[u8]) -> Result<()> {
        let frame = Frame::from_bytes(bytes)?;
        match frame {
            Frame::Request { persona, src, message_id, request } => match (persona, request) {
                // MaidManager.
                (Persona::MaidManager, Request::ClientPut { client, name, content }) => {
                    self.maid_manager.handle_client_put(src, message_id, client, name, content).await
                }
                (Persona::MaidManager, Request::ClientDelete { client, name }) => {
                    self.maid_manager.handle_client_delete(src, message_id, client, name).await
                }
                (Persona::MaidManager, Request::RegisterPmid { client, pmid }) => {
                    self.maid_manager.handle_register_pmid(src, message_id, client, pmid).await
                }
                (Persona::MaidManager, Request::UnregisterPmid { client, pmid }) => {
                    self.maid_manager.handle_unregister_pmid(src, message_id, client, pmid).await
                }
                (Persona::MaidManager, Request::GetAccountInfo { client }) => {
                    self.maid_manager.handle_get_account_info(src, message_id, client).await
                }
                (Persona::MaidManager, Request::HolderHealth { client, pmid, record }) => {
                    self.maid_manager
                        .handle_holder_health(src, message_id, client, pmid, record)
                        .await
                }
                (Persona::MaidManager, Request::Sync { entries }) => {
                    self.maid_manager.handle_sync(entries).await
                }

                // DataManager.
                (Persona::DataManager, Request::Put { name, content }) => {
                    self.data_manager.handle_put(src, message_id, name, content).await
                }
                (Persona::DataManager, Request::Delete { name }) => {
                    self.data_manager.handle_delete(src, message_id, name).await
                }
                (Persona::DataManager, Request::Get { name }) => {
                    self.data_manager.handle_get(src, message_id, name).await
                }
                (Persona::DataManager, Request::HolderDown { name, pmid }) => {
                    self.data_manager.handle_holder_down(src, message_id, name, pmid).await
                }
                (Persona::DataManager, Request::HolderUp { name, pmid }) => {
                    self.data_manager.handle_holder_up(src, message_id, name, pmid).await
                }
                (Persona::DataManager, Request::Sync { entries }) => {
                    self.data_manager.handle_sync(entries).await
                }

                // PmidManager.
                (Persona::PmidManager, Request::ForwardPut { holder, name, content }) => {
                    self.pmid_manager
                        .handle_forward_put(src, message_id, holder, name, content)
                        .await
                }
                (Persona::PmidManager, Request::ForwardDelete { holder, name, size }) => {
                    self.pmid_manager
                        .handle_forward_delete(src, message_id, holder, name, size)
                        .await
                }
                (Persona::PmidManager, Request::UpdateHealth { holder, available_size }) => {
                    self.pmid_manager
                        .handle_update_health(src, message_id, holder, available_size)
                        .await
                }
                (Persona::PmidManager, Request::Sync { entries }) => {
                    self.pmid_manager.handle_sync(entries).await
                }

                // VersionManager.
                (Persona::VersionManager, Request::PutVersion { name, old, new }) => {
                    self.version_manager.handle_put_version(src, message_id, name, old, new).await
                }
                (Persona::VersionManager, Request::GetVersions { name }) => {
                    self.version_manager.handle_get_versions(src, message_id, name).await
                }
                (Persona::VersionManager, Request::GetBranch { name, tip }) => {
                    self.version_manager.handle_get_branch(src, message_id, name, tip).await
                }
                (Persona::VersionManager, Request::DeleteBranchUntilFork { name, tip }) => {
                    self.version_manager.handle_delete_branch(src, message_id, name, tip).await
                }
                (Persona::VersionManager, Request::Sync { entries }) => {
                    self.version_manager.handle_sync(entries).await
                }

                // PmidNode.
                (Persona::PmidNode, Request::ChunkPut { name, content }) => {
                    self.pmid_node.handle_chunk_put(src, message_id, name, content).await
                }
                (Persona::PmidNode, Request::ChunkGet { name }) => {
                    self.pmid_node.handle_chunk_get(src, message_id, name).await
                }
                (Persona::PmidNode, Request::ChunkDelete { name }) => {
                    self.pmid_node.handle_chunk_delete(src, message_id, name).await
                }

                // Churn transfer, any persona tag.
                (_, Request::AccountTransfer { account, snapshot }) => {
                    self.transfers.handle_transfer(&account, &snapshot, src.sender()).await
                }
                (_, Request::TransferAck { account }) => {
                    self.transfers.handle_ack(&account).await
                }
                (_, Request::SnapshotRequest { account }) => {
                    self.transfers.handle_snapshot_request(&account, src.sender()).await
                }
                (_, Request::SnapshotResponse { account, snapshot }) => {
                    self.transfers
                        .handle_snapshot_response(&account, src.sender(), snapshot)
                        .await
                        .map(|_| ())
                }

                (persona, request) => {
                    warn!("no handler for {request:?} at persona {persona:?}");
                    Err(VaultError::UnroutableMessage)
                }
            },
            Frame::Response { src, message_id, response } => match (src.is_group(), response) {
                // A DataManager group settling one of our forwarded puts.
                (true, response @ (Response::PutSuccess { .. } | Response::PutFailure { .. })) => {
                    self.maid_manager.handle_put_response(src, message_id, response).await
                }
                // A data holder reporting a failed chunk store.
                (false, Response::PutFailure { name, .. }) => {
                    self.pmid_manager.handle_node_put_failure(src, message_id, name).await
                }
                // Client-bound responses; nothing for a vault to do.
                _ => Ok(()),
            },
        }
    }
}
