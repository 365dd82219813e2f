//! Persona action algebra: the closed set of typed mutations each persona
//! commits against its account values, together with the merge semantics
//! the whole group agrees on.
//!
//! Every action applies to an `Option<Value>` in place — `None` meaning
//! the row is absent — and the set-level actions are idempotent so that
//! replicas converge regardless of proposal interleaving.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::name::PmidName;
use crate::versions::{StructuredDataVersions, VersionName};

// ─── MaidManager ─────────────────────────────────────────────────────────────

/// Rollup of one registered holder's activity on behalf of the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmidRecord {
    pub stored_count: u64,
    pub stored_total_size: u64,
    pub lost_count: u64,
    pub lost_total_size: u64,
}

/// One client's storage account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaidAccountValue {
    pub data_stored: u64,
    pub space_available: u64,
    pub version: u64,
    pub total_stored_by_holders: u64,
    pub registered_holders: BTreeSet<PmidName>,
    pub holder_totals: BTreeMap<PmidName, PmidRecord>,
}

impl MaidAccountValue {
    pub fn new(allowance: u64) -> Self {
        MaidAccountValue {
            data_stored: 0,
            space_available: allowance,
            version: 0,
            total_stored_by_holders: 0,
            registered_holders: BTreeSet::new(),
            holder_totals: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaidManagerAction {
    /// Charge one storage unit for a put of `size` bytes.
    Put { size: u64 },
    /// Refund one unit (client delete, or downstream put failure).
    Refund { size: u64 },
    RegisterPmid { pmid: PmidName },
    UnregisterPmid { pmid: PmidName },
    /// Replace the health rollup for a registered holder.
    UpdateHolderRecord { pmid: PmidName, record: PmidRecord },
}

impl MaidManagerAction {
    pub fn apply(
        &self,
        value: &mut Option<MaidAccountValue>,
        allowance: u64,
    ) -> Result<(), VaultError> {
        match self {
            MaidManagerAction::Put { size } => {
                let account = value.get_or_insert_with(|| MaidAccountValue::new(allowance));
                if account.space_available < 1 {
                    return Err(VaultError::LowBalance);
                }
                account.data_stored += 1;
                account.space_available -= 1;
                account.total_stored_by_holders += size;
                account.version += 1;
                Ok(())
            }
            MaidManagerAction::Refund { size } => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                account.data_stored = account.data_stored.saturating_sub(1);
                account.space_available += 1;
                account.total_stored_by_holders =
                    account.total_stored_by_holders.saturating_sub(*size);
                account.version += 1;
                Ok(())
            }
            MaidManagerAction::RegisterPmid { pmid } => {
                let account = value.get_or_insert_with(|| MaidAccountValue::new(allowance));
                if account.registered_holders.insert(*pmid) {
                    account.holder_totals.insert(*pmid, PmidRecord::default());
                    account.version += 1;
                }
                Ok(())
            }
            MaidManagerAction::UnregisterPmid { pmid } => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                if account.registered_holders.remove(pmid) {
                    account.holder_totals.remove(pmid);
                    account.version += 1;
                }
                Ok(())
            }
            MaidManagerAction::UpdateHolderRecord { pmid, record } => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                if !account.registered_holders.contains(pmid) {
                    return Err(VaultError::NotFound);
                }
                account.holder_totals.insert(*pmid, record.clone());
                Ok(())
            }
        }
    }
}

// ─── DataManager ─────────────────────────────────────────────────────────────

/// Metadata for one data element the group is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAccountValue {
    pub data_size: u64,
    pub subscribers: i64,
    pub online_holders: BTreeSet<PmidName>,
    pub offline_holders: BTreeSet<PmidName>,
}

impl DataAccountValue {
    pub fn new(data_size: u64) -> Self {
        DataAccountValue {
            data_size,
            subscribers: 1,
            online_holders: BTreeSet::new(),
            offline_holders: BTreeSet::new(),
        }
    }
}

/// What a committed DataManager action changed, for the service to act on
/// outside the critical section.
#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// New row; holders still need to be chosen and sent the data.
    Created,
    Subscribed { subscribers: i64 },
    Unsubscribed { remaining: i64 },
    /// Last subscriber gone; row removed, listed holders should drop the
    /// chunk of `size` bytes.
    Removed { holders: BTreeSet<PmidName>, size: u64 },
    RemainingOnline(usize),
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataManagerAction {
    Put { size: u64, unique: bool },
    Delete,
    AddHolder { pmid: PmidName },
    RemoveHolder { pmid: PmidName },
    MarkHolderDown { pmid: PmidName },
    MarkHolderUp { pmid: PmidName },
}

impl DataManagerAction {
    pub fn apply(&self, value: &mut Option<DataAccountValue>) -> Result<DataOutcome, VaultError> {
        match self {
            DataManagerAction::Put { size, unique } => match value {
                None => {
                    *value = Some(DataAccountValue::new(*size));
                    Ok(DataOutcome::Created)
                }
                Some(account) => {
                    if *unique {
                        return Err(VaultError::DuplicateData);
                    }
                    account.subscribers += 1;
                    Ok(DataOutcome::Subscribed { subscribers: account.subscribers })
                }
            },
            DataManagerAction::Delete => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                account.subscribers -= 1;
                if account.subscribers <= 0 {
                    let mut holders = std::mem::take(&mut account.online_holders);
                    holders.append(&mut account.offline_holders);
                    let size = account.data_size;
                    *value = None;
                    Ok(DataOutcome::Removed { holders, size })
                } else {
                    Ok(DataOutcome::Unsubscribed { remaining: account.subscribers })
                }
            }
            DataManagerAction::AddHolder { pmid } => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                account.offline_holders.remove(pmid);
                account.online_holders.insert(*pmid);
                Ok(DataOutcome::Applied)
            }
            DataManagerAction::RemoveHolder { pmid } => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                account.online_holders.remove(pmid);
                account.offline_holders.remove(pmid);
                Ok(DataOutcome::Applied)
            }
            DataManagerAction::MarkHolderDown { pmid } => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                if account.online_holders.remove(pmid) {
                    account.offline_holders.insert(*pmid);
                }
                Ok(DataOutcome::RemainingOnline(account.online_holders.len()))
            }
            DataManagerAction::MarkHolderUp { pmid } => {
                let account = value.as_mut().ok_or(VaultError::NotFound)?;
                if account.offline_holders.remove(pmid) {
                    account.online_holders.insert(*pmid);
                }
                Ok(DataOutcome::Applied)
            }
        }
    }
}

// ─── PmidManager ─────────────────────────────────────────────────────────────

/// Per-holder rollup of the chunks assigned to one data-holding vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmidAccountValue {
    pub stored_count: u64,
    pub stored_total_size: u64,
    pub lost_count: u64,
    pub lost_total_size: u64,
    pub claimed_available_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PmidManagerAction {
    Put { size: u64 },
    Delete { size: u64 },
    /// The holder failed to produce a chunk it was assigned.
    MarkLost { size: u64 },
    UpdateHealth { available_size: u64 },
}

impl PmidManagerAction {
    pub fn apply(&self, value: &mut Option<PmidAccountValue>) -> Result<(), VaultError> {
        let account = value.get_or_insert_with(PmidAccountValue::default);
        match self {
            PmidManagerAction::Put { size } => {
                account.stored_count += 1;
                account.stored_total_size += size;
            }
            PmidManagerAction::Delete { size } => {
                account.stored_count = account.stored_count.saturating_sub(1);
                account.stored_total_size = account.stored_total_size.saturating_sub(*size);
            }
            PmidManagerAction::MarkLost { size } => {
                account.stored_count = account.stored_count.saturating_sub(1);
                account.stored_total_size = account.stored_total_size.saturating_sub(*size);
                account.lost_count += 1;
                account.lost_total_size += size;
            }
            PmidManagerAction::UpdateHealth { available_size } => {
                account.claimed_available_size = *available_size;
            }
        }
        Ok(())
    }
}

// ─── VersionManager ──────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum VersionOutcome {
    Applied,
    /// Row removed (last branch deleted).
    Removed,
    Tips(Vec<VersionName>),
    Branch(Vec<VersionName>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionManagerAction {
    PutVersion { old: Option<VersionName>, new: VersionName },
    DeleteBranchUntilFork { tip: VersionName },
    /// Pure reads, still serialized through the pipeline so they observe
    /// a committed prefix.
    GetVersions,
    GetBranch { tip: VersionName },
}

impl VersionManagerAction {
    pub fn apply(
        &self,
        value: &mut Option<StructuredDataVersions>,
        max_versions: usize,
        max_branches: usize,
    ) -> Result<VersionOutcome, VaultError> {
        match self {
            VersionManagerAction::PutVersion { old, new } => {
                let graph = value
                    .get_or_insert_with(|| StructuredDataVersions::new(max_versions, max_branches));
                graph.put(*old, *new)?;
                Ok(VersionOutcome::Applied)
            }
            VersionManagerAction::DeleteBranchUntilFork { tip } => {
                let graph = value.as_mut().ok_or(VaultError::NotFound)?;
                graph.delete_branch_until_fork(tip)?;
                if graph.is_empty() {
                    *value = None;
                    Ok(VersionOutcome::Removed)
                } else {
                    Ok(VersionOutcome::Applied)
                }
            }
            VersionManagerAction::GetVersions => {
                let graph = value.as_ref().ok_or(VaultError::NotFound)?;
                Ok(VersionOutcome::Tips(graph.tips()))
            }
            VersionManagerAction::GetBranch { tip } => {
                let graph = value.as_ref().ok_or(VaultError::NotFound)?;
                Ok(VersionOutcome::Branch(graph.get_branch(tip)?))
            }
        }
    }
}
