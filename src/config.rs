//! Store configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before the store is
//! opened.
//!
//! ## Environment Variables
//!
//! - `CUSTODY_DB_PATH`: Path to the ReDB database file
//! - `CUSTODY_MPC_NODES`: Number of MPC nodes; valid node ids are 1..=N
//! - `CUSTODY_DEFAULT_THRESHOLD`: Default t in t-of-n for new keyshares
//! - `CUSTODY_DEFAULT_TOTAL_SHARES`: Default n in t-of-n for new keyshares
//! - `RUST_LOG`: Log level filter

use std::env;
use std::path::PathBuf;

// Defaults: 2-of-3 shares across 5 nodes
const DEFAULT_MPC_NODES: u16 = 5;
const DEFAULT_THRESHOLD: u16 = 2;
const DEFAULT_TOTAL_SHARES: u16 = 3;
const DEFAULT_DB_NAME: &str = "custody.redb";

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    db_path: PathBuf,
    mpc_nodes: u16,
    default_threshold: u16,
    default_total_shares: u16,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Self {
        let db_path = env_trim("CUSTODY_DB_PATH")
            .parse::<PathBuf>()
            .unwrap_or_else(|_| PathBuf::from(format!("./.data/{DEFAULT_DB_NAME}")));

        let mpc_nodes = env_trim("CUSTODY_MPC_NODES")
            .parse::<u16>()
            .unwrap_or(DEFAULT_MPC_NODES);

        let default_threshold = env_trim("CUSTODY_DEFAULT_THRESHOLD")
            .parse::<u16>()
            .unwrap_or(DEFAULT_THRESHOLD);

        let default_total_shares = env_trim("CUSTODY_DEFAULT_TOTAL_SHARES")
            .parse::<u16>()
            .unwrap_or(DEFAULT_TOTAL_SHARES);

        Self {
            db_path,
            mpc_nodes,
            default_threshold,
            default_total_shares,
        }
    }

    /// Create settings for tests.
    pub fn for_tests() -> Self {
        Self {
            db_path: PathBuf::from("./.data/test-custody.redb"),
            mpc_nodes: DEFAULT_MPC_NODES,
            default_threshold: DEFAULT_THRESHOLD,
            default_total_shares: DEFAULT_TOTAL_SHARES,
        }
    }

    /// Validate settings.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.mpc_nodes == 0 {
            return Err("CUSTODY_MPC_NODES must be at least 1.".to_string());
        }

        if self.default_threshold == 0 || self.default_threshold > self.default_total_shares {
            return Err(format!(
                "Invalid keyshare defaults: threshold t={} must be >= 1 and <= n={}. \
                 Adjust CUSTODY_DEFAULT_THRESHOLD / CUSTODY_DEFAULT_TOTAL_SHARES.",
                self.default_threshold, self.default_total_shares
            ));
        }

        if self.default_total_shares > self.mpc_nodes {
            return Err(format!(
                "CUSTODY_DEFAULT_TOTAL_SHARES ({}) exceeds the node count ({}). \
                 Each share must land on a distinct node.",
                self.default_total_shares, self.mpc_nodes
            ));
        }

        Ok(())
    }

    // Getters

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn mpc_nodes(&self) -> u16 {
        self.mpc_nodes
    }

    pub fn default_threshold(&self) -> u16 {
        self.default_threshold
    }

    pub fn default_total_shares(&self) -> u16 {
        self.default_total_shares
    }
}
