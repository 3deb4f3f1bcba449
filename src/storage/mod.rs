//! Storage layer for the custody store.
//!
//! Uses ReDB for embedded key-value storage with ACID transactions.
//! Relational invariants (uniqueness, referential integrity, cascades) are
//! enforced through index tables maintained in the same write transaction as
//! the primary row.

mod balances;
mod keyshares;
mod redb;
mod transactions;
mod users;

pub use self::redb::Store;
