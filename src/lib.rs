// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., StoreError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs

//! Custody Store
//!
//! Embedded schema store for an MPC-keyshare-backed custodial wallet.
//! Persists users, threshold key shares, per-token balances and transaction
//! records on top of ReDB with relational-style invariants:
//!
//! - **Uniqueness**: user email, `(user, mpc node)` keyshare pairs,
//!   `(user, token mint)` balance rows and external transaction signatures
//!   are unique, enforced through index tables written in the same
//!   transaction as the primary row.
//!
//! - **Referential integrity**: child rows always reference an existing user;
//!   deleting a user cascades to its keyshares, balances and transactions
//!   atomically.
//!
//! - **Transaction lifecycle**: status moves from `pending` to `confirmed` or
//!   `failed` exactly once; terminal rows reject further transitions.
//!
//! The MPC signing protocol, on-chain broadcast and any HTTP surface are out
//! of scope. Those collaborators consume this crate through the [`Store`]
//! handle, which is cheap to clone and safe to share across threads.

pub mod config;
pub mod error;
pub mod model;
pub mod storage;

pub mod telemetry {
    //! Tracing initialization for binaries and tests embedding the store.

    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    /// Initialize tracing with console output only.
    pub fn init_tracing() {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "custody_store=info".into());
        let fmt_layer = tracing_subscriber::fmt::layer();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
}

// Re-export commonly used types
pub use config::Settings;
pub use error::{StoreError, StoreResult};
pub use model::{
    Keyshare, NewKeyshare, NewTransaction, NewUser, SecretShare, TokenBalance, Transaction,
    TransactionFilter, TransactionStatus, TransactionType, User, UserBalances,
};
pub use storage::Store;
