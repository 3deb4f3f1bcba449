//! ReDB database handle, table definitions and key encoding.
//!
//! Layout:
//! - `users`: user id -> JSON user record (including the password hash)
//! - `users_by_email`: email -> user id (uniqueness index)
//! - `keyshares`: `{user_id}:{node:05}` -> JSON keyshare
//! - `token_balances`: `{user_id}:{mint}` -> JSON balance row
//! - `transactions`: transaction id -> JSON transaction
//! - `tx_by_signature`: external signature -> transaction id (uniqueness index)
//! - `tx_by_user`: `{user_id}:{micros:020}:{tx_id}` -> transaction id
//! - `tx_by_status`: `{status}:{micros:020}:{tx_id}` -> transaction id
//!
//! Composite keys never contain `:` in their segments (UUIDs, zero-padded
//! numbers, base58 mints, lowercased emails), so prefix ranges are exact.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, TableDefinition};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::StoreResult;
use crate::model::{TransactionStatus, User};

// Table definitions
// Primary tables use string keys and byte values (JSON serialized); index
// tables map a unique or composite key back to the primary key.
pub(super) const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
pub(super) const USERS_BY_EMAIL: TableDefinition<&str, &str> =
    TableDefinition::new("users_by_email");
pub(super) const KEYSHARES: TableDefinition<&str, &[u8]> = TableDefinition::new("keyshares");
pub(super) const TOKEN_BALANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("token_balances");
pub(super) const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");
pub(super) const TX_BY_SIGNATURE: TableDefinition<&str, &str> =
    TableDefinition::new("tx_by_signature");
pub(super) const TX_BY_USER: TableDefinition<&str, &str> = TableDefinition::new("tx_by_user");
pub(super) const TX_BY_STATUS: TableDefinition<&str, &str> = TableDefinition::new("tx_by_status");

/// Keyshare placement policy, copied from [`Settings`] at open time.
///
/// Valid node ids are `1..=nodes`; threshold/total_shares are the defaults
/// applied when a keyshare request leaves them unset.
#[derive(Debug, Clone, Copy)]
pub(super) struct KeysharePolicy {
    pub nodes: u16,
    pub threshold: u16,
    pub total_shares: u16,
}

/// Store handle wrapping ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct Store {
    pub(super) db: Arc<Database>,
    pub(super) policy: KeysharePolicy,
}

impl Store {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path, settings: &Settings) -> StoreResult<Self> {
        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| crate::StoreError::Storage(e.to_string()))?;
        let store = Self::init(db, settings)?;

        tracing::info!(path = %path.display(), "Opened custody store");

        Ok(store)
    }

    /// Open an in-memory database for testing.
    #[cfg(test)]
    pub fn open_memory() -> StoreResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| crate::StoreError::Storage(e.to_string()))?;

        Self::init(db, &Settings::for_tests())
    }

    fn init(db: Database, settings: &Settings) -> StoreResult<Self> {
        let write_txn = db.begin_write()?;
        {
            // Just opening the tables creates them if they don't exist
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(USERS_BY_EMAIL)?;
            let _ = write_txn.open_table(KEYSHARES)?;
            let _ = write_txn.open_table(TOKEN_BALANCES)?;
            let _ = write_txn.open_table(TRANSACTIONS)?;
            let _ = write_txn.open_table(TX_BY_SIGNATURE)?;
            let _ = write_txn.open_table(TX_BY_USER)?;
            let _ = write_txn.open_table(TX_BY_STATUS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            policy: KeysharePolicy {
                nodes: settings.mpc_nodes(),
                threshold: settings.default_threshold(),
                total_shares: settings.default_total_shares(),
            },
        })
    }
}

// =============================================================================
// Records and key encoding
// =============================================================================

/// Persisted user row. Carries the password hash, which the public [`User`]
/// type never exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub agg_pubkey: Option<String>,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            agg_pubkey: self.agg_pubkey,
            balance: self.balance,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub(super) fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub(super) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Composite key for a keyshare: `{user_id}:{node:05}`.
///
/// Zero-padding keeps per-user shares ordered by node id.
pub(super) fn keyshare_key(user_id: Uuid, mpc_node_id: u16) -> String {
    format!("{user_id}:{mpc_node_id:05}")
}

/// Composite key for a token balance: `{user_id}:{mint}`.
pub(super) fn balance_key(user_id: Uuid, token_mint: &str) -> String {
    format!("{user_id}:{token_mint}")
}

/// Index key ordering a user's transactions by creation time.
pub(super) fn tx_user_key(user_id: Uuid, created_at: DateTime<Utc>, tx_id: Uuid) -> String {
    format!("{user_id}:{:020}:{tx_id}", created_at.timestamp_micros())
}

/// Index key ordering transactions of one status by creation time.
pub(super) fn tx_status_key(
    status: TransactionStatus,
    created_at: DateTime<Utc>,
    tx_id: Uuid,
) -> String {
    format!("{status}:{:020}:{tx_id}", created_at.timestamp_micros())
}

/// Bounds covering every key of the form `{owner}:...`.
///
/// `;` is the immediate successor of `:` in ASCII, so the half-open range
/// `["{owner}:", "{owner};")` is exactly the prefix.
pub(super) fn prefix_range(owner: &str) -> (String, String) {
    (format!("{owner}:"), format!("{owner};"))
}
