//! User operations: registration, lookup, credential verification, cached
//! SOL balance maintenance and cascade deletion.

use argon2::Argon2;
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::{NewUser, TokenBalance, Transaction, User, UserBalances};

use super::redb::{
    KEYSHARES, Store, TOKEN_BALANCES, TRANSACTIONS, TX_BY_SIGNATURE, TX_BY_STATUS, TX_BY_USER,
    USERS, USERS_BY_EMAIL, UserRecord, decode, encode, prefix_range, tx_status_key,
};

impl Store {
    /// Register a new user with a unique email.
    ///
    /// The password is stored as an Argon2id PHC string and never in plain
    /// form. Fails with [`StoreError::EmailTaken`] on a duplicate email.
    pub fn create_user(&self, new_user: NewUser) -> StoreResult<User> {
        let email = new_user.email.trim().to_lowercase();
        if !email.contains('@') || email.len() < 5 {
            return Err(StoreError::InvalidInput("Invalid email format".to_string()));
        }
        if new_user.password.len() < 8 {
            return Err(StoreError::InvalidInput(
                "Password must be at least 8 characters".to_string(),
            ));
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(new_user.password.as_bytes(), &salt)?
            .to_string();

        let now = Utc::now();
        let record = UserRecord {
            id: Uuid::new_v4(),
            email,
            password_hash,
            agg_pubkey: None,
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        let id_str = record.id.to_string();
        let value = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut users = write_txn.open_table(USERS)?;
            let mut by_email = write_txn.open_table(USERS_BY_EMAIL)?;

            if by_email.get(record.email.as_str())?.is_some() {
                // Dropping the transaction aborts it
                return Err(StoreError::EmailTaken(record.email));
            }

            users.insert(id_str.as_str(), value.as_slice())?;
            by_email.insert(record.email.as_str(), id_str.as_str())?;
        }
        write_txn.commit()?;

        tracing::debug!(user_id = %record.id, "Created user");
        Ok(record.into_user())
    }

    /// Look up a user by id.
    pub fn user(&self, user_id: Uuid) -> StoreResult<User> {
        Ok(self.user_record(user_id)?.into_user())
    }

    /// Look up a user by email.
    pub fn user_by_email(&self, email: &str) -> StoreResult<User> {
        let email = email.trim().to_lowercase();
        let read_txn = self.db.begin_read()?;
        let by_email = read_txn.open_table(USERS_BY_EMAIL)?;

        let user_id = match by_email.get(email.as_str())? {
            Some(v) => v.value().to_string(),
            None => return Err(StoreError::UserNotFound(email)),
        };

        let users = read_txn.open_table(USERS)?;
        match users.get(user_id.as_str())? {
            Some(v) => Ok(decode::<UserRecord>(v.value())?.into_user()),
            None => Err(StoreError::UserNotFound(email)),
        }
    }

    /// Verify a user's password against the stored Argon2 hash.
    ///
    /// Returns the user on success; [`StoreError::InvalidCredentials`] on a
    /// mismatch.
    pub fn verify_password(&self, email: &str, password: &str) -> StoreResult<User> {
        let email = email.trim().to_lowercase();
        let read_txn = self.db.begin_read()?;
        let by_email = read_txn.open_table(USERS_BY_EMAIL)?;

        let user_id = match by_email.get(email.as_str())? {
            Some(v) => v.value().to_string(),
            None => return Err(StoreError::UserNotFound(email)),
        };

        let users = read_txn.open_table(USERS)?;
        let record: UserRecord = match users.get(user_id.as_str())? {
            Some(v) => decode(v.value())?,
            None => return Err(StoreError::UserNotFound(email)),
        };

        let parsed = PasswordHash::new(&record.password_hash)?;
        Argon2::default().verify_password(password.as_bytes(), &parsed)?;

        Ok(record.into_user())
    }

    /// Record the aggregated public key produced by MPC key generation.
    pub fn set_aggregated_pubkey(&self, user_id: Uuid, agg_pubkey: &str) -> StoreResult<User> {
        let record = self.update_user_record(user_id, |record| {
            record.agg_pubkey = Some(agg_pubkey.to_string());
            Ok(())
        })?;

        tracing::debug!(user_id = %user_id, "Set aggregated pubkey");
        Ok(record.into_user())
    }

    /// Get the cached SOL balance.
    pub fn sol_balance(&self, user_id: Uuid) -> StoreResult<Decimal> {
        Ok(self.user_record(user_id)?.balance)
    }

    /// Overwrite the cached SOL balance (settlement reconciliation path).
    pub fn set_sol_balance(&self, user_id: Uuid, balance: Decimal) -> StoreResult<()> {
        if balance < Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Balance must be non-negative".to_string(),
            ));
        }

        self.update_user_record(user_id, |record| {
            record.balance = balance;
            Ok(())
        })?;

        Ok(())
    }

    /// Add to the cached SOL balance (deposits). Returns the new balance.
    pub fn credit_sol(&self, user_id: Uuid, amount: Decimal) -> StoreResult<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Amount must be positive".to_string(),
            ));
        }

        let record = self.update_user_record(user_id, |record| {
            record.balance += amount;
            Ok(())
        })?;

        Ok(record.balance)
    }

    /// Subtract from the cached SOL balance (withdrawals). Returns the new
    /// balance; fails with [`StoreError::InsufficientBalance`] on overdraft.
    pub fn debit_sol(&self, user_id: Uuid, amount: Decimal) -> StoreResult<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Amount must be positive".to_string(),
            ));
        }

        let record = self.update_user_record(user_id, |record| {
            if record.balance < amount {
                return Err(StoreError::InsufficientBalance {
                    available: record.balance,
                    requested: amount,
                });
            }
            record.balance -= amount;
            Ok(())
        })?;

        Ok(record.balance)
    }

    /// List users, newest first.
    pub fn list_users(&self, limit: usize, offset: usize) -> StoreResult<Vec<User>> {
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;

        let mut records: Vec<UserRecord> = Vec::new();
        for entry in users.iter()? {
            let (_, v) = entry?;
            records.push(decode(v.value())?);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(records
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(UserRecord::into_user)
            .collect())
    }

    /// Total number of users.
    pub fn count_users(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;
        Ok(users.iter()?.count() as u64)
    }

    /// Get a user's cached SOL balance together with all token balance rows,
    /// ordered by symbol.
    pub fn user_with_balances(&self, user_id: Uuid) -> StoreResult<UserBalances> {
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;

        let id_str = user_id.to_string();
        let record: UserRecord = match users.get(id_str.as_str())? {
            Some(v) => decode(v.value())?,
            None => return Err(StoreError::UserNotFound(id_str)),
        };

        let balances = read_txn.open_table(TOKEN_BALANCES)?;
        let (start, end) = prefix_range(&id_str);
        let mut token_balances: Vec<TokenBalance> = Vec::new();
        for entry in balances.range(start.as_str()..end.as_str())? {
            let (_, v) = entry?;
            token_balances.push(decode(v.value())?);
        }
        token_balances.sort_by(|a, b| a.token_symbol.cmp(&b.token_symbol));

        Ok(UserBalances {
            user_id,
            sol_balance: record.balance,
            token_balances,
        })
    }

    /// Delete a user and cascade to all dependent rows.
    ///
    /// Runs as a single write transaction: the user row, the email index
    /// entry, every keyshare, every token balance and every transaction
    /// (including its signature/status/user index entries) go together.
    pub fn delete_user(&self, user_id: Uuid) -> StoreResult<()> {
        let id_str = user_id.to_string();
        let (start, end) = prefix_range(&id_str);

        let write_txn = self.db.begin_write()?;
        let (keyshares_removed, balances_removed, transactions_removed) = {
            let mut users = write_txn.open_table(USERS)?;
            let mut by_email = write_txn.open_table(USERS_BY_EMAIL)?;
            let mut keyshares = write_txn.open_table(KEYSHARES)?;
            let mut balances = write_txn.open_table(TOKEN_BALANCES)?;
            let mut txs = write_txn.open_table(TRANSACTIONS)?;
            let mut by_sig = write_txn.open_table(TX_BY_SIGNATURE)?;
            let mut by_user = write_txn.open_table(TX_BY_USER)?;
            let mut by_status = write_txn.open_table(TX_BY_STATUS)?;

            let record: UserRecord = match users.get(id_str.as_str())? {
                Some(v) => decode(v.value())?,
                None => return Err(StoreError::UserNotFound(id_str)),
            };
            users.remove(id_str.as_str())?;
            by_email.remove(record.email.as_str())?;

            let keyshare_keys: Vec<String> = keyshares
                .range(start.as_str()..end.as_str())?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, redb::StorageError>>()?;
            for key in &keyshare_keys {
                keyshares.remove(key.as_str())?;
            }

            let balance_keys: Vec<String> = balances
                .range(start.as_str()..end.as_str())?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, redb::StorageError>>()?;
            for key in &balance_keys {
                balances.remove(key.as_str())?;
            }

            let index_entries: Vec<(String, String)> = by_user
                .range(start.as_str()..end.as_str())?
                .map(|entry| entry.map(|(k, v)| (k.value().to_string(), v.value().to_string())))
                .collect::<Result<_, redb::StorageError>>()?;
            for (index_key, tx_id) in &index_entries {
                let tx: Option<Transaction> = match txs.get(tx_id.as_str())? {
                    Some(v) => Some(decode(v.value())?),
                    None => None,
                };
                if let Some(tx) = tx {
                    if let Some(sig) = &tx.tx_signature {
                        by_sig.remove(sig.as_str())?;
                    }
                    by_status.remove(tx_status_key(tx.status, tx.created_at, tx.id).as_str())?;
                    txs.remove(tx_id.as_str())?;
                }
                by_user.remove(index_key.as_str())?;
            }

            (
                keyshare_keys.len(),
                balance_keys.len(),
                index_entries.len(),
            )
        };
        write_txn.commit()?;

        tracing::info!(
            user_id = %user_id,
            keyshares = keyshares_removed,
            balances = balances_removed,
            transactions = transactions_removed,
            "Deleted user with cascade"
        );
        Ok(())
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    pub(super) fn user_record(&self, user_id: Uuid) -> StoreResult<UserRecord> {
        let id_str = user_id.to_string();
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;

        match users.get(id_str.as_str())? {
            Some(v) => decode(v.value()),
            None => Err(StoreError::UserNotFound(id_str)),
        }
    }

    /// Read-modify-write a user row in its own write transaction.
    pub(super) fn update_user_record<F>(&self, user_id: Uuid, apply: F) -> StoreResult<UserRecord>
    where
        F: FnOnce(&mut UserRecord) -> StoreResult<()>,
    {
        let id_str = user_id.to_string();
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut users = write_txn.open_table(USERS)?;

            let mut record: UserRecord = match users.get(id_str.as_str())? {
                Some(v) => decode(v.value())?,
                None => return Err(StoreError::UserNotFound(id_str)),
            };

            apply(&mut record)?;
            record.updated_at = Utc::now();
            users.insert(id_str.as_str(), encode(&record)?.as_slice())?;
            record
        };
        write_txn.commit()?;

        Ok(record)
    }
}
