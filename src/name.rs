//! Data names — the tagged (kind, identity) pair that identifies every
//! piece of data in the network — and their storage-key codec.
//!
//! A name encodes to `BASE32_NOPAD(identity)` followed by the kind tag in
//! decimal.  The base32 run has a fixed width (64 bytes → 103 chars), so
//! decoding splits at a constant offset.  The encoding is stable across
//! restarts and across vaults; account snapshots depend on that.

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::error::VaultError;

/// Fixed-width opaque identity (a SHA-512-sized digest in the overlay).
pub const IDENTITY_SIZE: usize = 64;

/// Width of `BASE32_NOPAD(identity)`: ceil(64 * 8 / 5).
const ENCODED_IDENTITY_LEN: usize = 103;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(#[serde(with = "BigArray")] pub [u8; IDENTITY_SIZE]);

impl Identity {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, VaultError> {
        let arr: [u8; IDENTITY_SIZE] = slice
            .try_into()
            .map_err(|_| VaultError::MalformedName(format!("identity of {} bytes", slice.len())))?;
        Ok(Identity(arr))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 6 hex chars are enough to tell identities apart in logs.
        write!(f, "Identity({}..)", hex::encode(&self.0[..3]))
    }
}

/// Name of a vault holding data replicas.
pub type PmidName = Identity;
/// Name of a client account principal.
pub type MaidName = Identity;

// ─── Kind ────────────────────────────────────────────────────────────────────

/// Closed enumeration of data kinds.  Tag values are part of the storage
/// key format and must never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataKind {
    ImmutableData,
    OwnerDirectory,
    GroupDirectory,
    WorldDirectory,
    Anmid,
    Ansmid,
    Antmid,
    Anmaid,
    Maid,
    Pmid,
    Mid,
    Smid,
    Tmid,
    Anmpid,
    Mpid,
    MutableData,
}

impl DataKind {
    pub fn tag(self) -> u32 {
        match self {
            DataKind::ImmutableData => 0,
            DataKind::OwnerDirectory => 1,
            DataKind::GroupDirectory => 2,
            DataKind::WorldDirectory => 3,
            DataKind::Anmid => 4,
            DataKind::Ansmid => 5,
            DataKind::Antmid => 6,
            DataKind::Anmaid => 7,
            DataKind::Maid => 8,
            DataKind::Pmid => 9,
            DataKind::Mid => 10,
            DataKind::Smid => 11,
            DataKind::Tmid => 12,
            DataKind::Anmpid => 13,
            DataKind::Mpid => 14,
            DataKind::MutableData => 15,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self, VaultError> {
        Ok(match tag {
            0 => DataKind::ImmutableData,
            1 => DataKind::OwnerDirectory,
            2 => DataKind::GroupDirectory,
            3 => DataKind::WorldDirectory,
            4 => DataKind::Anmid,
            5 => DataKind::Ansmid,
            6 => DataKind::Antmid,
            7 => DataKind::Anmaid,
            8 => DataKind::Maid,
            9 => DataKind::Pmid,
            10 => DataKind::Mid,
            11 => DataKind::Smid,
            12 => DataKind::Tmid,
            13 => DataKind::Anmpid,
            14 => DataKind::Mpid,
            15 => DataKind::MutableData,
            other => return Err(VaultError::MalformedName(format!("unknown kind tag {other}"))),
        })
    }

    /// Unique kinds may exist at most once per name; a second put of the
    /// same name is a conflict rather than a duplicate store.
    pub fn is_unique(self) -> bool {
        !matches!(
            self,
            DataKind::ImmutableData
                | DataKind::MutableData
                | DataKind::OwnerDirectory
                | DataKind::GroupDirectory
                | DataKind::WorldDirectory
        )
    }
}

// ─── Name ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataName {
    pub kind: DataKind,
    pub identity: Identity,
}

impl DataName {
    pub fn new(kind: DataKind, identity: Identity) -> Self {
        DataName { kind, identity }
    }

    /// Encode to the storage key used inside an account's keyspace.
    pub fn encode(&self) -> String {
        let mut key = BASE32_NOPAD.encode(self.identity.as_bytes());
        key.push_str(&self.kind.tag().to_string());
        key
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(key: &str) -> Result<Self, VaultError> {
        if key.len() <= ENCODED_IDENTITY_LEN {
            return Err(VaultError::MalformedName(format!("key of {} chars", key.len())));
        }
        let (encoded_identity, tag_str) = key.split_at(ENCODED_IDENTITY_LEN);
        let identity_bytes = BASE32_NOPAD
            .decode(encoded_identity.as_bytes())
            .map_err(|e| VaultError::MalformedName(e.to_string()))?;
        let tag: u32 = tag_str
            .parse()
            .map_err(|_| VaultError::MalformedName(format!("bad kind tag '{tag_str}'")))?;
        Ok(DataName {
            kind: DataKind::from_tag(tag)?,
            identity: Identity::from_slice(&identity_bytes)?,
        })
    }
}

/// Deterministic account id for the account owned by `owner`.  The same
/// derivation runs on every replica, so snapshot transfers land in the
/// identical keyspace on the receiving vault.
pub fn account_id(persona_prefix: &str, owner: &Identity) -> String {
    let mut id = String::with_capacity(persona_prefix.len() + ENCODED_IDENTITY_LEN);
    id.push_str(persona_prefix);
    id.push_str(&BASE32_NOPAD.encode(owner.as_bytes()));
    id
}

/// Recover the owning identity from an account id (the persona prefix is
/// everything before the fixed-width base32 run).
pub fn account_owner(account: &str) -> Result<Identity, VaultError> {
    if account.len() < ENCODED_IDENTITY_LEN {
        return Err(VaultError::MalformedName(format!("account id '{account}'")));
    }
    let encoded = &account[account.len() - ENCODED_IDENTITY_LEN..];
    let bytes = BASE32_NOPAD
        .decode(encoded.as_bytes())
        .map_err(|e| VaultError::MalformedName(e.to_string()))?;
    Identity::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(fill: u8) -> Identity {
        Identity([fill; IDENTITY_SIZE])
    }

    #[test]
    fn encode_decode_roundtrip_all_kinds() {
        for tag in 0..16 {
            let kind = DataKind::from_tag(tag).unwrap();
            let name = DataName::new(kind, identity(tag as u8));
            assert_eq!(DataName::decode(&name.encode()).unwrap(), name);
        }
    }

    #[test]
    fn encode_is_stable() {
        let name = DataName::new(DataKind::ImmutableData, identity(7));
        assert_eq!(name.encode(), name.encode());
    }

    #[test]
    fn encoded_identity_width_is_fixed() {
        let a = DataName::new(DataKind::ImmutableData, identity(0)).encode();
        let b = DataName::new(DataKind::MutableData, identity(0xff)).encode();
        // Same base32 width; only the decimal tag differs in length.
        assert_eq!(a.len(), ENCODED_IDENTITY_LEN + 1);
        assert_eq!(b.len(), ENCODED_IDENTITY_LEN + 2);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut key = BASE32_NOPAD.encode(&[1u8; IDENTITY_SIZE]);
        key.push_str("99");
        assert!(matches!(DataName::decode(&key), Err(VaultError::MalformedName(_))));
    }

    #[test]
    fn truncated_key_is_malformed() {
        assert!(matches!(DataName::decode("ABC"), Err(VaultError::MalformedName(_))));
    }

    #[test]
    fn account_ids_are_deterministic_and_prefixed()  {
        let owner = identity(3);
        assert_eq!(account_id("dm:", &owner), account_id("dm:", &owner));
        assert_ne!(account_id("dm:", &owner), account_id("mm:", &owner));
    }

    #[test]
    fn account_owner_inverts_account_id() {
        let owner = identity(9);
        let id = account_id("vm:", &owner);
        assert_eq!(account_owner(&id).unwrap(), owner);
    }

    #[test]
    fn unique_kinds() {
        assert!(!DataKind::ImmutableData.is_unique());
        assert!(!DataKind::OwnerDirectory.is_unique());
        assert!(DataKind::Maid.is_unique());
        assert!(DataKind::Tmid.is_unique());
    }
}
