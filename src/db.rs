//! Durable account store — one shared SQLite database, logically
//! partitioned per account.
//!
//! Rows carry `(account_id, db_key, value)`; the account id is derived
//! deterministically from the owning name so the partitioning survives
//! restarts and is identical on every replica.  Snapshots are CBOR of the
//! ordered row list and therefore byte-stable: `snapshot → load →
//! snapshot` round-trips exactly.

use std::path::Path;

use futures_util::TryStreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::{Result, VaultError};
use crate::wire::{decode_cbor, encode_cbor};

#[derive(Clone)]
pub struct AccountDb {
    pool: SqlitePool,
}

impl AccountDb {
    /// Open (or create) the store at `{root}/vault.db`.  Never wipes an
    /// existing database; crash recovery is the engine's WAL.
    pub async fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let url = format!("sqlite://{}/vault.db?mode=rwc", root.display());
        let pool = SqlitePoolOptions::new().connect(&url).await?;
        let db = AccountDb { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = AccountDb { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS accounts (
                account_id  TEXT NOT NULL,
                db_key      TEXT NOT NULL,
                value       BLOB NOT NULL,
                PRIMARY KEY (account_id, db_key)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic write with overwrite semantics.
    pub async fn put(&self, account: &str, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO accounts (account_id, db_key, value) VALUES (?, ?, ?)
               ON CONFLICT(account_id, db_key) DO UPDATE SET value = excluded.value"#,
        )
        .bind(account)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, account: &str, key: &str) -> Result<Vec<u8>> {
        let row = sqlx::query("SELECT value FROM accounts WHERE account_id = ? AND db_key = ?")
            .bind(account)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.get("value")).ok_or(VaultError::NotFound)
    }

    /// Idempotent: deleting an absent key succeeds.
    pub async fn delete(&self, account: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE account_id = ? AND db_key = ?")
            .bind(account)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All rows of one account in ascending key order.
    pub async fn scan(&self, account: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut rows = sqlx::query(
            "SELECT db_key, value FROM accounts WHERE account_id = ? ORDER BY db_key ASC",
        )
        .bind(account)
        .fetch(&self.pool);
        let mut entries = Vec::new();
        while let Some(row) = rows.try_next().await? {
            entries.push((row.get("db_key"), row.get("value")));
        }
        Ok(entries)
    }

    /// Point-in-time image of one account, used for churn transfer.
    pub async fn snapshot(&self, account: &str) -> Result<Vec<u8>> {
        let entries = self.scan(account).await?;
        encode_cbor(&entries)
    }

    /// Atomic replace of one account from a snapshot.
    pub async fn load(&self, account: &str, snapshot: &[u8]) -> Result<()> {
        let entries: Vec<(String, Vec<u8>)> = decode_cbor(snapshot)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM accounts WHERE account_id = ?")
            .bind(account)
            .execute(&mut *tx)
            .await?;
        for (key, value) in &entries {
            sqlx::query("INSERT INTO accounts (account_id, db_key, value) VALUES (?, ?, ?)")
                .bind(account)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove every row of one account (after a completed handoff).
    pub async fn drop_account(&self, account: &str) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE account_id = ?")
            .bind(account)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Distinct account ids currently held under a persona prefix.
    pub async fn list_accounts(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', ""));
        let mut rows = sqlx::query(
            "SELECT DISTINCT account_id FROM accounts WHERE account_id LIKE ? ORDER BY account_id",
        )
        .bind(pattern)
        .fetch(&self.pool);
        let mut accounts = Vec::new();
        while let Some(row) = rows.try_next().await? {
            accounts.push(row.get("account_id"));
        }
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> AccountDb {
        AccountDb::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn put_get_overwrite() {
        let db = test_db().await;
        db.put("acc", "k1", b"v1").await.unwrap();
        assert_eq!(db.get("acc", "k1").await.unwrap(), b"v1");
        db.put("acc", "k1", b"v2").await.unwrap();
        assert_eq!(db.get("acc", "k1").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let db = test_db().await;
        assert_eq!(db.get("acc", "nope").await.unwrap_err(), VaultError::NotFound);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let db = test_db().await;
        db.put("acc", "k", b"v").await.unwrap();
        db.delete("acc", "k").await.unwrap();
        db.delete("acc", "k").await.unwrap();
        assert_eq!(db.get("acc", "k").await.unwrap_err(), VaultError::NotFound);
    }

    #[tokio::test]
    async fn accounts_are_isolated() {
        let db = test_db().await;
        db.put("a", "k", b"va").await.unwrap();
        db.put("b", "k", b"vb").await.unwrap();
        assert_eq!(db.get("a", "k").await.unwrap(), b"va");
        assert_eq!(db.get("b", "k").await.unwrap(), b"vb");
        db.drop_account("a").await.unwrap();
        assert_eq!(db.get("a", "k").await.unwrap_err(), VaultError::NotFound);
        assert_eq!(db.get("b", "k").await.unwrap(), b"vb");
    }

    #[tokio::test]
    async fn scan_is_ordered_without_duplicates() {
        let db = test_db().await;
        for key in ["c", "a", "b", "a"] {
            db.put("acc", key, key.as_bytes()).await.unwrap();
        }
        let entries = db.scan("acc").await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn snapshot_load_snapshot_is_byte_identical() {
        let db = test_db().await;
        for i in 0..10u8 {
            db.put("acc", &format!("key{i}"), &[i; 16]).await.unwrap();
        }
        let first = db.snapshot("acc").await.unwrap();
        db.load("acc", &first).await.unwrap();
        let second = db.snapshot("acc").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn load_replaces_existing_rows() {
        let db = test_db().await;
        db.put("acc", "old", b"gone").await.unwrap();
        let other = test_db().await;
        other.put("acc", "new", b"kept").await.unwrap();
        let snapshot = other.snapshot("acc").await.unwrap();

        db.load("acc", &snapshot).await.unwrap();
        assert_eq!(db.get("acc", "old").await.unwrap_err(), VaultError::NotFound);
        assert_eq!(db.get("acc", "new").await.unwrap(), b"kept");
    }

    #[tokio::test]
    async fn list_accounts_filters_by_prefix() {
        let db = test_db().await;
        db.put("dm:x", "k", b"v").await.unwrap();
        db.put("dm:y", "k", b"v").await.unwrap();
        db.put("mm:z", "k", b"v").await.unwrap();
        assert_eq!(db.list_accounts("dm:").await.unwrap(), vec!["dm:x", "dm:y"]);
    }
}
