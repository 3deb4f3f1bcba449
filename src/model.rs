//! Persisted entities and enumerations.
//!
//! Field names follow the persisted column contract: `tx_signature`,
//! `transaction_type`, `token_mint` and friends serialize exactly as stored.
//! Keyshare payloads are wrapped in [`SecretShare`] so they zeroize on drop
//! and never leak through `Debug` output.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

// =============================================================================
// Users
// =============================================================================

/// Identity record for a custodial wallet user.
///
/// `balance` is the cached native SOL balance maintained by the settlement
/// operations; per-token holdings live in [`TokenBalance`] rows. The password
/// hash is persisted but never exposed on this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// Aggregated public key from MPC key generation.
    pub agg_pubkey: Option<String>,
    /// Cached SOL balance.
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for user registration.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
}

/// A user's cached SOL balance together with all token balance rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalances {
    pub user_id: Uuid,
    pub sol_balance: Decimal,
    pub token_balances: Vec<TokenBalance>,
}

// =============================================================================
// Keyshares
// =============================================================================

/// One secret share of a user's threshold key.
///
/// Payloads arrive already envelope-encrypted by the MPC layer; this crate
/// treats them as opaque secrets.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretShare(String);

impl SecretShare {
    pub fn new(share: impl Into<String>) -> Self {
        Self(share.into())
    }

    /// Access the share payload. Callers must not log the returned value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretShare(..)")
    }
}

impl From<&str> for SecretShare {
    fn from(share: &str) -> Self {
        Self::new(share)
    }
}

impl From<String> for SecretShare {
    fn from(share: String) -> Self {
        Self(share)
    }
}

/// One secret share of a user's threshold key, held by one MPC node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyshare {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Node holding this share (1-based).
    pub mpc_node_id: u16,
    pub private_key_share: SecretShare,
    pub public_key: String,
    /// t in t-of-n.
    pub threshold: u16,
    /// n in t-of-n.
    pub total_shares: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for keyshare creation.
///
/// Threshold parameters default to the configured t-of-n when unset.
#[derive(Debug, Clone)]
pub struct NewKeyshare {
    pub user_id: Uuid,
    pub mpc_node_id: u16,
    pub private_key_share: SecretShare,
    pub public_key: String,
    pub threshold: Option<u16>,
    pub total_shares: Option<u16>,
}

/// Aggregate keyshare counts for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct KeyshareStats {
    pub total_keyshares: u64,
    pub users_with_shares: u64,
    pub active_nodes: u64,
}

// =============================================================================
// Token balances
// =============================================================================

/// Per-user, per-asset ledger snapshot. At most one row per (user, mint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub id: Uuid,
    pub user_id: Uuid,
    /// On-chain mint address of the token.
    pub token_mint: String,
    pub token_symbol: String,
    pub balance: Decimal,
    pub decimals: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Transactions
// =============================================================================

/// Kind of value movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deposit => write!(f, "deposit"),
            Self::Withdrawal => write!(f, "withdrawal"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            "transfer" => Ok(Self::Transfer),
            other => Err(format!(
                "Invalid transaction type '{other}'. Must be 'deposit', 'withdrawal' or 'transfer'."
            )),
        }
    }
}

/// Transaction lifecycle state.
///
/// The lifecycle is monotonic: `pending` moves to `confirmed` or `failed`
/// exactly once, and terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    /// Whether the lifecycle allows moving to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed) | (Self::Pending, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(format!(
                "Invalid transaction status '{other}'. Must be 'pending', 'confirmed' or 'failed'."
            )),
        }
    }
}

/// A recorded movement of value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// External on-chain signature; globally unique when present.
    pub tx_signature: Option<String>,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    /// None for native SOL.
    pub token_mint: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub fee: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for recording a transaction. Status always starts as `pending`;
/// fee defaults to zero.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub token_mint: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub fee: Option<Decimal>,
    pub tx_signature: Option<String>,
}

impl NewTransaction {
    /// Minimal constructor; addresses, fee and signature stay unset.
    pub fn new(user_id: Uuid, transaction_type: TransactionType, amount: Decimal) -> Self {
        Self {
            user_id,
            transaction_type,
            amount,
            token_mint: None,
            from_address: None,
            to_address: None,
            fee: None,
            tx_signature: None,
        }
    }
}

/// Optional status/type filter for transaction queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    pub fn by_status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            transaction_type: None,
        }
    }

    pub fn by_type(transaction_type: TransactionType) -> Self {
        Self {
            status: None,
            transaction_type: Some(transaction_type),
        }
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        self.status.is_none_or(|s| tx.status == s)
            && self.transaction_type.is_none_or(|t| tx.transaction_type == t)
    }
}

/// Aggregate transaction counters for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionStats {
    pub total_transactions: u64,
    pub pending: u64,
    pub failed: u64,
    /// Sum of confirmed amounts.
    pub confirmed_volume: Decimal,
}
