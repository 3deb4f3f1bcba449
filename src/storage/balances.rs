//! Token balance operations.
//!
//! One row per (user, mint), maintained by upsert so concurrent settlement
//! never duplicates a pair. Credits require the row to exist already so that
//! mint metadata (symbol, decimals) is never fabricated; `transfer_token`
//! creates the recipient row from the sender's metadata.

use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::TokenBalance;

use super::redb::{
    Store, TOKEN_BALANCES, USERS, balance_key, decode, encode, prefix_range,
};

impl Store {
    /// Create or update the balance row for (user, mint).
    ///
    /// The upsert is keyed on the composite row key, so re-submitting the
    /// same pair overwrites amount and metadata instead of inserting a
    /// duplicate.
    pub fn upsert_token_balance(
        &self,
        user_id: Uuid,
        token_mint: &str,
        token_symbol: &str,
        balance: Decimal,
        decimals: u32,
    ) -> StoreResult<TokenBalance> {
        if token_mint.is_empty() {
            return Err(StoreError::InvalidInput(
                "Token mint must not be empty".to_string(),
            ));
        }
        if balance < Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Balance must be non-negative".to_string(),
            ));
        }

        let key = balance_key(user_id, token_mint);
        let now = Utc::now();

        let write_txn = self.db.begin_write()?;
        let row = {
            let users = write_txn.open_table(USERS)?;
            if users.get(user_id.to_string().as_str())?.is_none() {
                return Err(StoreError::UserNotFound(user_id.to_string()));
            }

            let mut balances = write_txn.open_table(TOKEN_BALANCES)?;
            let existing: Option<TokenBalance> = match balances.get(key.as_str())? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };

            let row = match existing {
                Some(mut row) => {
                    row.token_symbol = token_symbol.to_string();
                    row.balance = balance;
                    row.decimals = decimals;
                    row.updated_at = now;
                    row
                }
                None => TokenBalance {
                    id: Uuid::new_v4(),
                    user_id,
                    token_mint: token_mint.to_string(),
                    token_symbol: token_symbol.to_string(),
                    balance,
                    decimals,
                    created_at: now,
                    updated_at: now,
                },
            };

            balances.insert(key.as_str(), encode(&row)?.as_slice())?;
            row
        };
        write_txn.commit()?;

        tracing::debug!(user_id = %user_id, token_mint, "Upserted token balance");
        Ok(row)
    }

    /// Get the balance amount for (user, mint). A missing row reads as zero.
    pub fn token_balance(&self, user_id: Uuid, token_mint: &str) -> StoreResult<Decimal> {
        let key = balance_key(user_id, token_mint);
        let read_txn = self.db.begin_read()?;
        let balances = read_txn.open_table(TOKEN_BALANCES)?;

        match balances.get(key.as_str())? {
            Some(v) => Ok(decode::<TokenBalance>(v.value())?.balance),
            None => Ok(Decimal::ZERO),
        }
    }

    /// Get the full balance row for (user, mint).
    pub fn token_balance_info(&self, user_id: Uuid, token_mint: &str) -> StoreResult<TokenBalance> {
        let key = balance_key(user_id, token_mint);
        let read_txn = self.db.begin_read()?;
        let balances = read_txn.open_table(TOKEN_BALANCES)?;

        match balances.get(key.as_str())? {
            Some(v) => decode(v.value()),
            None => Err(StoreError::BalanceNotFound {
                user_id,
                token_mint: token_mint.to_string(),
            }),
        }
    }

    /// All token balances for a user, ordered by symbol.
    pub fn user_token_balances(&self, user_id: Uuid) -> StoreResult<Vec<TokenBalance>> {
        let read_txn = self.db.begin_read()?;
        let balances = read_txn.open_table(TOKEN_BALANCES)?;

        let (start, end) = prefix_range(&user_id.to_string());
        let mut rows: Vec<TokenBalance> = Vec::new();
        for entry in balances.range(start.as_str()..end.as_str())? {
            let (_, v) = entry?;
            rows.push(decode(v.value())?);
        }
        rows.sort_by(|a, b| a.token_symbol.cmp(&b.token_symbol));

        Ok(rows)
    }

    /// Add to an existing token balance (deposits). Returns the new amount.
    pub fn credit_token(
        &self,
        user_id: Uuid,
        token_mint: &str,
        amount: Decimal,
    ) -> StoreResult<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Amount must be positive".to_string(),
            ));
        }

        self.adjust_token_balance(user_id, token_mint, amount)
    }

    /// Subtract from an existing token balance (withdrawals). Returns the new
    /// amount; fails with [`StoreError::InsufficientBalance`] on overdraft.
    pub fn debit_token(
        &self,
        user_id: Uuid,
        token_mint: &str,
        amount: Decimal,
    ) -> StoreResult<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Amount must be positive".to_string(),
            ));
        }

        self.adjust_token_balance(user_id, token_mint, -amount)
    }

    /// Move tokens between two users atomically.
    ///
    /// The recipient row is created on demand from the sender's mint
    /// metadata. Returns (sender, recipient) post-transfer amounts.
    pub fn transfer_token(
        &self,
        from_user_id: Uuid,
        to_user_id: Uuid,
        token_mint: &str,
        amount: Decimal,
    ) -> StoreResult<(Decimal, Decimal)> {
        if amount <= Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Transfer amount must be positive".to_string(),
            ));
        }
        if from_user_id == to_user_id {
            return Err(StoreError::InvalidInput(
                "Cannot transfer to the same user".to_string(),
            ));
        }

        let from_key = balance_key(from_user_id, token_mint);
        let to_key = balance_key(to_user_id, token_mint);
        let now = Utc::now();

        let write_txn = self.db.begin_write()?;
        let result = {
            let users = write_txn.open_table(USERS)?;
            if users.get(to_user_id.to_string().as_str())?.is_none() {
                return Err(StoreError::UserNotFound(to_user_id.to_string()));
            }

            let mut balances = write_txn.open_table(TOKEN_BALANCES)?;

            let mut sender: TokenBalance = match balances.get(from_key.as_str())? {
                Some(v) => decode(v.value())?,
                None => {
                    return Err(StoreError::InsufficientBalance {
                        available: Decimal::ZERO,
                        requested: amount,
                    });
                }
            };
            if sender.balance < amount {
                return Err(StoreError::InsufficientBalance {
                    available: sender.balance,
                    requested: amount,
                });
            }

            let mut recipient: TokenBalance = match balances.get(to_key.as_str())? {
                Some(v) => decode(v.value())?,
                None => TokenBalance {
                    id: Uuid::new_v4(),
                    user_id: to_user_id,
                    token_mint: sender.token_mint.clone(),
                    token_symbol: sender.token_symbol.clone(),
                    balance: Decimal::ZERO,
                    decimals: sender.decimals,
                    created_at: now,
                    updated_at: now,
                },
            };

            sender.balance -= amount;
            sender.updated_at = now;
            recipient.balance += amount;
            recipient.updated_at = now;

            balances.insert(from_key.as_str(), encode(&sender)?.as_slice())?;
            balances.insert(to_key.as_str(), encode(&recipient)?.as_slice())?;

            (sender.balance, recipient.balance)
        };
        write_txn.commit()?;

        tracing::debug!(
            from = %from_user_id,
            to = %to_user_id,
            token_mint,
            %amount,
            "Transferred tokens"
        );
        Ok(result)
    }

    /// Delete zero-amount balance rows, for one user or store-wide.
    /// Returns the number of rows removed.
    pub fn prune_zero_balances(&self, user_id: Option<Uuid>) -> StoreResult<u64> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut balances = write_txn.open_table(TOKEN_BALANCES)?;

            let zero_keys: Vec<String> = match user_id {
                Some(user_id) => {
                    let (start, end) = prefix_range(&user_id.to_string());
                    collect_zero_keys(balances.range(start.as_str()..end.as_str())?)?
                }
                None => collect_zero_keys(balances.iter()?)?,
            };

            for key in &zero_keys {
                balances.remove(key.as_str())?;
            }
            zero_keys.len() as u64
        };
        write_txn.commit()?;

        if removed > 0 {
            tracing::info!(removed, "Pruned zero balances");
        }
        Ok(removed)
    }

    fn adjust_token_balance(
        &self,
        user_id: Uuid,
        token_mint: &str,
        delta: Decimal,
    ) -> StoreResult<Decimal> {
        let key = balance_key(user_id, token_mint);

        let write_txn = self.db.begin_write()?;
        let new_balance = {
            let mut balances = write_txn.open_table(TOKEN_BALANCES)?;

            let mut row: TokenBalance = match balances.get(key.as_str())? {
                Some(v) => decode(v.value())?,
                None => {
                    return Err(StoreError::BalanceNotFound {
                        user_id,
                        token_mint: token_mint.to_string(),
                    });
                }
            };

            if row.balance + delta < Decimal::ZERO {
                return Err(StoreError::InsufficientBalance {
                    available: row.balance,
                    requested: -delta,
                });
            }

            row.balance += delta;
            row.updated_at = Utc::now();
            balances.insert(key.as_str(), encode(&row)?.as_slice())?;
            row.balance
        };
        write_txn.commit()?;

        Ok(new_balance)
    }
}

fn collect_zero_keys(
    range: redb::Range<'_, &'static str, &'static [u8]>,
) -> StoreResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in range {
        let (k, v) = entry?;
        let row: TokenBalance = decode(v.value())?;
        if row.balance.is_zero() {
            keys.push(k.value().to_string());
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewUser;

    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn store_with_user() -> (Store, Uuid) {
        let store = Store::open_memory().unwrap();
        let user = store
            .create_user(NewUser {
                email: "bal@example.com".to_string(),
                password: "hunter2-hunter2".to_string(),
            })
            .unwrap();
        (store, user.id)
    }

    #[test]
    fn test_upsert_updates_instead_of_duplicating() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        store.upsert_token_balance(user_id, USDC, "USDC", Decimal::ZERO, 6)?;
        store.upsert_token_balance(user_id, USDC, "USDC", Decimal::new(50, 0), 6)?;

        let rows = store.user_token_balances(user_id)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].balance, Decimal::new(50, 0));
        assert_eq!(store.token_balance(user_id, USDC)?, Decimal::new(50, 0));

        Ok(())
    }

    #[test]
    fn test_upsert_preserves_row_identity() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        let first = store.upsert_token_balance(user_id, USDC, "USDC", Decimal::ONE, 6)?;
        let second = store.upsert_token_balance(user_id, USDC, "USDC", Decimal::TWO, 6)?;

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        Ok(())
    }

    #[test]
    fn test_upsert_requires_existing_user() {
        let store = Store::open_memory().unwrap();
        let err = store
            .upsert_token_balance(Uuid::new_v4(), USDC, "USDC", Decimal::ONE, 6)
            .unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
    }

    #[test]
    fn test_missing_balance_reads_as_zero() -> StoreResult<()> {
        let (store, user_id) = store_with_user();
        assert_eq!(store.token_balance(user_id, USDC)?, Decimal::ZERO);
        assert!(matches!(
            store.token_balance_info(user_id, USDC),
            Err(StoreError::BalanceNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_credit_and_debit() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        // Credits need an existing row with mint metadata
        let err = store.credit_token(user_id, USDC, Decimal::ONE).unwrap_err();
        assert!(matches!(err, StoreError::BalanceNotFound { .. }));

        store.upsert_token_balance(user_id, USDC, "USDC", Decimal::new(10, 0), 6)?;
        assert_eq!(
            store.credit_token(user_id, USDC, Decimal::new(5, 0))?,
            Decimal::new(15, 0)
        );
        assert_eq!(
            store.debit_token(user_id, USDC, Decimal::new(15, 0))?,
            Decimal::ZERO
        );

        let err = store.debit_token(user_id, USDC, Decimal::ONE).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientBalance { .. }));

        Ok(())
    }

    #[test]
    fn test_transfer_creates_recipient_row() -> StoreResult<()> {
        let (store, alice) = store_with_user();
        let bob = store
            .create_user(NewUser {
                email: "bob@example.com".to_string(),
                password: "hunter2-hunter2".to_string(),
            })?
            .id;

        store.upsert_token_balance(alice, USDC, "USDC", Decimal::new(100, 0), 6)?;
        let (sender, recipient) =
            store.transfer_token(alice, bob, USDC, Decimal::new(40, 0))?;
        assert_eq!(sender, Decimal::new(60, 0));
        assert_eq!(recipient, Decimal::new(40, 0));

        let bob_row = store.token_balance_info(bob, USDC)?;
        assert_eq!(bob_row.token_symbol, "USDC");
        assert_eq!(bob_row.decimals, 6);

        Ok(())
    }

    #[test]
    fn test_transfer_insufficient_leaves_both_untouched() -> StoreResult<()> {
        let (store, alice) = store_with_user();
        let bob = store
            .create_user(NewUser {
                email: "bob2@example.com".to_string(),
                password: "hunter2-hunter2".to_string(),
            })?
            .id;

        store.upsert_token_balance(alice, USDC, "USDC", Decimal::new(10, 0), 6)?;
        let err = store
            .transfer_token(alice, bob, USDC, Decimal::new(40, 0))
            .unwrap_err();
        assert!(matches!(err, StoreError::InsufficientBalance { .. }));

        assert_eq!(store.token_balance(alice, USDC)?, Decimal::new(10, 0));
        assert_eq!(store.token_balance(bob, USDC)?, Decimal::ZERO);
        Ok(())
    }

    #[test]
    fn test_transfer_requires_recipient_user() -> StoreResult<()> {
        let (store, alice) = store_with_user();
        store.upsert_token_balance(alice, USDC, "USDC", Decimal::new(10, 0), 6)?;

        let err = store
            .transfer_token(alice, Uuid::new_v4(), USDC, Decimal::ONE)
            .unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
        Ok(())
    }

    #[test]
    fn test_prune_zero_balances() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        store.upsert_token_balance(user_id, USDC, "USDC", Decimal::ZERO, 6)?;
        store.upsert_token_balance(user_id, "So11111111111111111111111111111111111111112", "WSOL", Decimal::ONE, 9)?;

        assert_eq!(store.prune_zero_balances(Some(user_id))?, 1);
        let rows = store.user_token_balances(user_id)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token_symbol, "WSOL");

        Ok(())
    }
}
