//! One node ("vault") of a distributed, self-authenticating storage
//! network: the replicated per-persona account engine.
//!
//! The pipeline, per inbound routed message: dispatcher → persona
//! handler → accumulator (dedup + sender quorum) → unresolved-action log
//! (group quorum) → account database, with the synchronizer shipping
//! proposals between group members and moving whole accounts on churn.
//! The overlay itself stays outside; the harness hands in a [`Router`]
//! and feeds bytes to [`Vault::handle_message`].

pub mod accumulator;
pub mod actions;
pub mod chunk_store;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod name;
pub mod personas;
pub mod routing;
pub mod sync;
pub mod unresolved;
pub mod versions;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::task::JoinHandle;

pub use crate::config::Config;
pub use crate::error::{Result, VaultError};
pub use crate::name::{DataKind, DataName, Identity, MaidName, PmidName};
pub use crate::routing::{Destination, MessageId, PeerId, Router, SrcAuthority};
pub use crate::versions::VersionName;
pub use crate::wire::{Frame, Persona, Request, Response};

use crate::chunk_store::ChunkStore;
use crate::db::AccountDb;
use crate::dispatch::Demultiplexer;
use crate::personas::{DataManager, MaidManager, PmidManager, PmidNode, VersionManager};
use crate::sync::TransferCoordinator;

pub struct Vault {
    pub maid_manager: Arc<MaidManager>,
    pub data_manager: Arc<DataManager>,
    pub pmid_manager: Arc<PmidManager>,
    pub version_manager: Arc<VersionManager>,
    pub pmid_node: Arc<PmidNode>,
    pub transfers: Arc<TransferCoordinator>,
    demux: Demultiplexer,
    db: AccountDb,
}

impl Vault {
    /// Open the stores under `config.vault_root_dir` and wire up every
    /// persona.  Existing state is reused, never wiped.
    pub async fn new(config: Config, router: Arc<dyn Router>) -> Result<Arc<Self>> {
        config.validate()?;
        let db = AccountDb::open(&config.vault_root_dir).await?;
        let chunks = ChunkStore::open(&config.vault_root_dir).await?;
        Ok(Self::assemble(config, router, db, chunks))
    }

    /// Same wiring over caller-supplied stores (in-memory in tests).
    pub fn with_stores(
        config: Config,
        router: Arc<dyn Router>,
        db: AccountDb,
        chunks: ChunkStore,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::assemble(config, router, db, chunks))
    }

    fn assemble(
        config: Config,
        router: Arc<dyn Router>,
        db: AccountDb,
        chunks: ChunkStore,
    ) -> Arc<Self> {
        let maid_manager = Arc::new(MaidManager::new(db.clone(), router.clone(), &config));
        let data_manager = Arc::new(DataManager::new(db.clone(), router.clone(), &config));
        let pmid_manager = Arc::new(PmidManager::new(db.clone(), router.clone(), &config));
        let version_manager = Arc::new(VersionManager::new(db.clone(), router.clone(), &config));
        let pmid_node = Arc::new(PmidNode::new(chunks, router.clone(), &config));
        let transfers =
            Arc::new(TransferCoordinator::new(db.clone(), router, config.group_size));
        let demux = Demultiplexer::new(
            maid_manager.clone(),
            data_manager.clone(),
            pmid_manager.clone(),
            version_manager.clone(),
            pmid_node.clone(),
            transfers.clone(),
        );
        Arc::new(Vault {
            maid_manager,
            data_manager,
            pmid_manager,
            version_manager,
            pmid_node,
            transfers,
            demux,
            db,
        })
    }

    /// Entry point for bytes delivered by the router.
    pub async fn handle_message(&self, bytes: &[u8]) -> Result<()> {
        self.demux.handle_message(bytes).await
    }

    /// Routing churn: hand off every account this vault is no longer
    /// responsible for.  Returns how many hand-offs started.
    pub async fn handle_churn(&self) -> Result<usize> {
        self.transfers.hand_off_lost_accounts().await
    }

    /// One pass of background upkeep: expire pipeline state and
    /// rebroadcast proposals still waiting on peers.
    pub async fn maintain(&self) -> Result<()> {
        self.maid_manager.maintain().await?;
        self.data_manager.maintain().await?;
        self.pmid_manager.maintain().await?;
        self.version_manager.maintain().await?;
        Ok(())
    }

    /// Run [`maintain`](Self::maintain) on an interval until dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let vault = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = vault.maintain().await {
                    warn!("maintenance pass failed: {e}");
                }
            }
        })
    }

    /// Direct access to the account store (used by harnesses and tests).
    pub fn db(&self) -> &AccountDb {
        &self.db
    }
}
