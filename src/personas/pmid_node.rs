//! PmidNode — the persona that actually stores chunk bytes, on
//! instruction from its own PmidManager group.
//!
//! No unresolved log here: the group already agreed before the
//! instruction arrived, so the accumulator's quorum gate is the only
//! admission control.  Storage is the filesystem chunk store.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::accumulator::{Accumulator, Fingerprint};
use crate::chunk_store::ChunkStore;
use crate::config::Config;
use crate::error::{Result, VaultError};
use crate::name::{DataName, Identity};
use crate::routing::{Destination, MessageId, Router, SrcAuthority};
use crate::wire::{Frame, Persona, Request, Response};

use super::{admit, expect_group, expect_single, Admit};

pub struct PmidNode {
    chunks: ChunkStore,
    router: Arc<dyn Router>,
    group_size: usize,
    accumulator: Mutex<Accumulator>,
}

impl PmidNode {
    pub fn new(chunks: ChunkStore, router: Arc<dyn Router>, config: &Config) -> Self {
        PmidNode {
            chunks,
            router,
            group_size: config.group_size,
            accumulator: Mutex::new(Accumulator::new(config.accumulator_ttl())),
        }
    }

    async fn admit_request(&self, src: &SrcAuthority, message_id: MessageId) -> Result<bool> {
        let mut accumulator = self.accumulator.lock().await;
        match admit(&mut accumulator, src, message_id, self.group_size) {
            Admit::Admitted => Ok(true),
            Admit::Pending => Ok(false),
            Admit::AlreadyHandled(reply) => {
                if let Some(bytes) = reply {
                    self.router.send(Destination::Peer(src.sender()), bytes);
                }
                Err(VaultError::DuplicateRequest)
            }
        }
    }

    pub async fn handle_chunk_put(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
        content: Vec<u8>,
    ) -> Result<()> {
        expect_group(&src)?;
        if !self.admit_request(&src, message_id).await? {
            return Ok(());
        }
        match self.chunks.put(&name, &content).await {
            Ok(()) => {
                info!("stored chunk {:?} ({} bytes)", name, content.len());
                Ok(())
            }
            Err(error) => {
                // Tell our managers the store failed so they can mark the
                // chunk lost and re-replicate elsewhere.
                let frame = Frame::Response {
                    src: SrcAuthority::Single { peer: self.router.our_id() },
                    message_id,
                    response: Response::PutFailure { name, error: error.clone() },
                };
                if let Ok(bytes) = frame.to_bytes() {
                    let our_name = Identity::from(self.router.our_id());
                    self.router.send(Destination::Group(our_name), bytes);
                }
                Err(error)
            }
        }
    }

    pub async fn handle_chunk_get(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
    ) -> Result<()> {
        expect_single(&src)?;
        if !self.admit_request(&src, message_id).await? {
            return Ok(());
        }
        let response = match self.chunks.get(&name).await {
            Ok(content) => Response::GetSuccess { name, content },
            Err(error) => {
                warn!("chunk {:?} requested but unavailable: {error}", name);
                Response::Failure { error }
            }
        };
        let frame = Frame::Response {
            src: SrcAuthority::Single { peer: self.router.our_id() },
            message_id,
            response,
        };
        let bytes = frame.to_bytes()?;
        {
            let mut accumulator = self.accumulator.lock().await;
            accumulator.set_handled(Fingerprint::new(message_id, &src), Some(bytes.clone()));
        }
        self.router.send(Destination::Peer(src.sender()), bytes);
        Ok(())
    }

    pub async fn handle_chunk_delete(
        &self,
        src: SrcAuthority,
        message_id: MessageId,
        name: DataName,
    ) -> Result<()> {
        expect_group(&src)?;
        if !self.admit_request(&src, message_id).await? {
            return Ok(());
        }
        self.chunks.delete(&name).await
    }

    /// Report claimed free space to our own PmidManager group.
    pub fn report_health(&self, available_size: u64) -> Result<()> {
        let our_id = self.router.our_id();
        let our_name = Identity::from(our_id);
        let frame = Frame::Request {
            persona: Persona::PmidManager,
            src: SrcAuthority::Single { peer: our_id },
            message_id: MessageId::random(),
            request: Request::UpdateHealth { holder: our_name, available_size },
        };
        self.router.send(Destination::Group(our_name), frame.to_bytes()?);
        Ok(())
    }
}
