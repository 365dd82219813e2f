//! Synchronizer — ships locally proposed actions to the rest of the
//! close group, and moves whole accounts between vaults during churn.
//!
//! Proposal broadcast is fire-and-forget: entries go out once after
//! `add_local` and again on every maintenance tick until they commit or
//! time out.  Account transfer is push-based on leaving responsibility
//! (snapshot → new group → ack → local delete) and pull-based on joining
//! (snapshot request → install the majority's identical snapshot).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::db::AccountDb;
use crate::error::{Result, VaultError};
use crate::name::{account_owner, Identity};
use crate::routing::{Destination, MessageId, PeerId, Router, SrcAuthority};
use crate::unresolved::UnresolvedEntry;
use crate::wire::{encode_cbor, Frame, Persona, Request, SyncEnvelope};

// ─── Proposal broadcast ──────────────────────────────────────────────────────

/// Ship `proposals` to every other member of each account's close group.
/// Entries are batched per owner so each group sees one frame.
pub fn broadcast_proposals<A: Serialize>(
    router: &dyn Router,
    persona: Persona,
    proposals: &[UnresolvedEntry<A>],
) -> Result<()> {
    let our_id = router.our_id();
    let mut batches: HashMap<Identity, Vec<SyncEnvelope>> = HashMap::new();
    for proposal in proposals {
        batches.entry(proposal.owner).or_default().push(SyncEnvelope {
            owner: proposal.owner,
            name: proposal.name,
            action: encode_cbor(&proposal.action)?,
            message_id: proposal.message_id,
            originator: our_id,
        });
    }
    for (owner, entries) in batches {
        let frame = Frame::Request {
            persona,
            src: SrcAuthority::Single { peer: our_id },
            message_id: MessageId::random(),
            request: Request::Sync { entries },
        };
        router.send(Destination::Group(owner), frame.to_bytes()?);
    }
    Ok(())
}

// ─── Account transfer ────────────────────────────────────────────────────────

/// Coordinates churn-time account movement for every persona.  Accounts
/// are addressed by their persona-prefixed id, so one coordinator serves
/// the whole vault.
pub struct TransferCoordinator {
    db: AccountDb,
    router: Arc<dyn Router>,
    group_size: usize,
    /// Accounts handed off, awaiting an ack before the local copy goes.
    pending_acks: Mutex<HashSet<String>>,
    /// Snapshots collected per account while joining responsibility.
    incoming: Mutex<HashMap<String, Vec<(PeerId, Vec<u8>)>>>,
}

impl TransferCoordinator {
    pub fn new(db: AccountDb, router: Arc<dyn Router>, group_size: usize) -> Self {
        TransferCoordinator {
            db,
            router,
            group_size,
            pending_acks: Mutex::new(HashSet::new()),
            incoming: Mutex::new(HashMap::new()),
        }
    }

    fn frame_for(&self, account: &str, request: Request) -> Result<(Identity, Vec<u8>)> {
        let owner = account_owner(account)?;
        let persona = Persona::for_account(account).ok_or(VaultError::UnroutableMessage)?;
        let frame = Frame::Request {
            persona,
            src: SrcAuthority::Single { peer: self.router.our_id() },
            message_id: MessageId::random(),
            request,
        };
        Ok((owner, frame.to_bytes()?))
    }

    /// We are no longer close to `account`: push its snapshot to the now
    /// responsible group.  The local copy stays until a peer acks.
    pub async fn hand_off(&self, account: &str) -> Result<()> {
        let snapshot = self.db.snapshot(account).await?;
        let (owner, bytes) = self.frame_for(
            account,
            Request::AccountTransfer { account: account.to_string(), snapshot },
        )?;
        self.pending_acks.lock().await.insert(account.to_string());
        info!("handing off account {account}");
        self.router.send(Destination::Group(owner), bytes);
        Ok(())
    }

    /// A leaving vault pushed us a snapshot: install it and ack.
    pub async fn handle_transfer(
        &self,
        account: &str,
        snapshot: &[u8],
        from: PeerId,
    ) -> Result<()> {
        self.db.load(account, snapshot).await?;
        info!("installed transferred account {account}");
        let (_, bytes) =
            self.frame_for(account, Request::TransferAck { account: account.to_string() })?;
        self.router.send(Destination::Peer(from), bytes);
        Ok(())
    }

    /// The receiving side confirmed; the account is theirs now.
    pub async fn handle_ack(&self, account: &str) -> Result<()> {
        if !self.pending_acks.lock().await.remove(account) {
            debug!("ignoring ack for account {account} not pending hand-off");
            return Ok(());
        }
        self.db.drop_account(account).await
    }

    /// We became responsible for `account`: ask the group for snapshots.
    pub async fn request_account(&self, account: &str) -> Result<()> {
        let (owner, bytes) = self
            .frame_for(account, Request::SnapshotRequest { account: account.to_string() })?;
        self.incoming.lock().await.insert(account.to_string(), Vec::new());
        self.router.send(Destination::Group(owner), bytes);
        Ok(())
    }

    pub async fn handle_snapshot_request(&self, account: &str, from: PeerId) -> Result<()> {
        let snapshot = self.db.snapshot(account).await?;
        let (_, bytes) = self.frame_for(
            account,
            Request::SnapshotResponse { account: account.to_string(), snapshot },
        )?;
        self.router.send(Destination::Peer(from), bytes);
        Ok(())
    }

    /// Collect a peer's snapshot; install once a majority of the group
    /// sent byte-identical content.  Returns whether the account was
    /// installed by this response.
    pub async fn handle_snapshot_response(
        &self,
        account: &str,
        from: PeerId,
        snapshot: Vec<u8>,
    ) -> Result<bool> {
        let majority = (self.group_size + 1) / 2;
        let chosen = {
            let mut incoming = self.incoming.lock().await;
            let responses = match incoming.get_mut(account) {
                Some(responses) => responses,
                None => {
                    debug!("unsolicited snapshot for {account} from {from:?}");
                    return Ok(false);
                }
            };
            if responses.iter().any(|(peer, _)| *peer == from) {
                return Ok(false);
            }
            let agreed = 1 + responses.iter().filter(|(_, bytes)| bytes == &snapshot).count();
            responses.push((from, snapshot.clone()));
            if agreed >= majority {
                incoming.remove(account);
                Some(snapshot)
            } else {
                None
            }
        };
        match chosen {
            Some(snapshot) => {
                self.db.load(account, &snapshot).await?;
                info!("account {account} installed from {} matching snapshots", majority);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Hand off every held account whose close group no longer contains
    /// this vault.  Called on routing churn.
    pub async fn hand_off_lost_accounts(&self) -> Result<usize> {
        let our_id = self.router.our_id();
        let mut lost = 0;
        for persona in [
            Persona::MaidManager,
            Persona::DataManager,
            Persona::PmidManager,
            Persona::VersionManager,
        ] {
            for account in self.db.list_accounts(persona.account_prefix()).await? {
                let owner = match account_owner(&account) {
                    Ok(owner) => owner,
                    Err(e) => {
                        warn!("unparseable account id {account}: {e}");
                        continue;
                    }
                };
                if !self.router.close_group(&owner).contains(&our_id) {
                    self.hand_off(&account).await?;
                    lost += 1;
                }
            }
        }
        Ok(lost)
    }
}
