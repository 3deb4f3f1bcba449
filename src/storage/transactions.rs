//! Transaction records and settlement.
//!
//! Every row starts as `pending` and moves to `confirmed` or `failed` exactly
//! once. External signatures are globally unique. The user and status index
//! tables are maintained alongside the primary row so the indexed queries
//! stay consistent under the same write transaction.

use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    NewTransaction, TokenBalance, Transaction, TransactionFilter, TransactionStats,
    TransactionStatus, TransactionType,
};

use super::redb::{
    Store, TOKEN_BALANCES, TRANSACTIONS, TX_BY_SIGNATURE, TX_BY_STATUS, TX_BY_USER, USERS,
    UserRecord, balance_key, decode, encode, prefix_range, tx_status_key, tx_user_key,
};

// Recipient rows created by settlement before the indexer has supplied mint
// metadata (mirrors the original settlement path).
const UNKNOWN_SYMBOL: &str = "UNKNOWN";
const UNKNOWN_DECIMALS: u32 = 6;

impl Store {
    /// Record a new transaction.
    ///
    /// Status starts as `pending`, fee defaults to zero. Fails with
    /// [`StoreError::DuplicateSignature`] when the supplied external
    /// signature is already recorded, and [`StoreError::UserNotFound`] when
    /// the owner is absent.
    pub fn record_transaction(&self, request: NewTransaction) -> StoreResult<Transaction> {
        if request.amount <= Decimal::ZERO {
            return Err(StoreError::InvalidInput(
                "Amount must be positive".to_string(),
            ));
        }
        if let Some(fee) = request.fee {
            if fee < Decimal::ZERO {
                return Err(StoreError::InvalidInput(
                    "Fee must be non-negative".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let tx = Transaction {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            tx_signature: request.tx_signature,
            transaction_type: request.transaction_type,
            status: TransactionStatus::Pending,
            amount: request.amount,
            token_mint: request.token_mint,
            from_address: request.from_address,
            to_address: request.to_address,
            fee: request.fee.unwrap_or(Decimal::ZERO),
            created_at: now,
            updated_at: now,
        };
        let id_str = tx.id.to_string();

        let write_txn = self.db.begin_write()?;
        {
            let users = write_txn.open_table(USERS)?;
            if users.get(tx.user_id.to_string().as_str())?.is_none() {
                return Err(StoreError::UserNotFound(tx.user_id.to_string()));
            }

            let mut txs = write_txn.open_table(TRANSACTIONS)?;
            let mut by_sig = write_txn.open_table(TX_BY_SIGNATURE)?;
            let mut by_user = write_txn.open_table(TX_BY_USER)?;
            let mut by_status = write_txn.open_table(TX_BY_STATUS)?;

            if let Some(sig) = &tx.tx_signature {
                if by_sig.get(sig.as_str())?.is_some() {
                    return Err(StoreError::DuplicateSignature(sig.clone()));
                }
                by_sig.insert(sig.as_str(), id_str.as_str())?;
            }

            txs.insert(id_str.as_str(), encode(&tx)?.as_slice())?;
            by_user.insert(
                tx_user_key(tx.user_id, tx.created_at, tx.id).as_str(),
                id_str.as_str(),
            )?;
            by_status.insert(
                tx_status_key(tx.status, tx.created_at, tx.id).as_str(),
                id_str.as_str(),
            )?;
        }
        write_txn.commit()?;

        tracing::debug!(tx_id = %tx.id, user_id = %tx.user_id, "Recorded transaction");
        Ok(tx)
    }

    /// Look up a transaction by id.
    pub fn transaction(&self, tx_id: Uuid) -> StoreResult<Transaction> {
        let id_str = tx_id.to_string();
        let read_txn = self.db.begin_read()?;
        let txs = read_txn.open_table(TRANSACTIONS)?;

        match txs.get(id_str.as_str())? {
            Some(v) => decode(v.value()),
            None => Err(StoreError::TransactionNotFound(id_str)),
        }
    }

    /// Look up a transaction by external signature.
    pub fn transaction_by_signature(&self, tx_signature: &str) -> StoreResult<Transaction> {
        let read_txn = self.db.begin_read()?;
        let by_sig = read_txn.open_table(TX_BY_SIGNATURE)?;

        let tx_id = match by_sig.get(tx_signature)? {
            Some(v) => v.value().to_string(),
            None => return Err(StoreError::TransactionNotFound(tx_signature.to_string())),
        };

        let txs = read_txn.open_table(TRANSACTIONS)?;
        match txs.get(tx_id.as_str())? {
            Some(v) => decode(v.value()),
            None => Err(StoreError::TransactionNotFound(tx_signature.to_string())),
        }
    }

    /// A user's transactions, newest first, with optional status/type filter.
    pub fn user_transactions(
        &self,
        user_id: Uuid,
        filter: TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Transaction>> {
        let read_txn = self.db.begin_read()?;
        let by_user = read_txn.open_table(TX_BY_USER)?;
        let txs = read_txn.open_table(TRANSACTIONS)?;

        let (start, end) = prefix_range(&user_id.to_string());
        let ids: Vec<String> = by_user
            .range(start.as_str()..end.as_str())?
            .map(|entry| entry.map(|(_, v)| v.value().to_string()))
            .collect::<Result<_, redb::StorageError>>()?;

        let mut out = Vec::new();
        let mut skipped = 0usize;
        // The index is ordered oldest first; walk it backwards
        for tx_id in ids.iter().rev() {
            let tx: Transaction = match txs.get(tx_id.as_str())? {
                Some(v) => decode(v.value())?,
                None => continue,
            };
            if !filter.matches(&tx) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            out.push(tx);
            if out.len() == limit {
                break;
            }
        }

        Ok(out)
    }

    /// Count a user's transactions matching the filter.
    pub fn count_user_transactions(
        &self,
        user_id: Uuid,
        filter: TransactionFilter,
    ) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let by_user = read_txn.open_table(TX_BY_USER)?;
        let txs = read_txn.open_table(TRANSACTIONS)?;

        let (start, end) = prefix_range(&user_id.to_string());
        let mut count = 0u64;
        for entry in by_user.range(start.as_str()..end.as_str())? {
            let (_, v) = entry?;
            let tx: Transaction = match txs.get(v.value())? {
                Some(value) => decode(value.value())?,
                None => continue,
            };
            if filter.matches(&tx) {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Transactions in one status, oldest first (the processing queue).
    pub fn transactions_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> StoreResult<Vec<Transaction>> {
        let read_txn = self.db.begin_read()?;
        let by_status = read_txn.open_table(TX_BY_STATUS)?;
        let txs = read_txn.open_table(TRANSACTIONS)?;

        let (start, end) = prefix_range(&status.to_string());
        let mut out = Vec::new();
        for entry in by_status.range(start.as_str()..end.as_str())? {
            let (_, v) = entry?;
            let tx: Transaction = match txs.get(v.value())? {
                Some(value) => decode(value.value())?,
                None => continue,
            };
            out.push(tx);
            if out.len() == limit {
                break;
            }
        }

        Ok(out)
    }

    /// Move a transaction along its lifecycle, optionally attaching the
    /// external signature.
    ///
    /// Only `pending -> confirmed` and `pending -> failed` are legal;
    /// anything else fails with [`StoreError::InvalidStatusTransition`].
    pub fn update_transaction_status(
        &self,
        tx_id: Uuid,
        status: TransactionStatus,
        tx_signature: Option<&str>,
    ) -> StoreResult<Transaction> {
        let id_str = tx_id.to_string();

        let write_txn = self.db.begin_write()?;
        let tx = {
            let mut txs = write_txn.open_table(TRANSACTIONS)?;
            let mut by_sig = write_txn.open_table(TX_BY_SIGNATURE)?;
            let mut by_status = write_txn.open_table(TX_BY_STATUS)?;

            let mut tx: Transaction = match txs.get(id_str.as_str())? {
                Some(v) => decode(v.value())?,
                None => return Err(StoreError::TransactionNotFound(id_str)),
            };

            Self::apply_status_change(
                &mut tx,
                status,
                tx_signature,
                &mut txs,
                &mut by_sig,
                &mut by_status,
            )?;
            tx
        };
        write_txn.commit()?;

        tracing::debug!(tx_id = %tx.id, status = %tx.status, "Updated transaction status");
        Ok(tx)
    }

    /// Mark a pending transaction failed.
    pub fn fail_transaction(&self, tx_id: Uuid) -> StoreResult<Transaction> {
        self.update_transaction_status(tx_id, TransactionStatus::Failed, None)
    }

    /// Confirm a pending deposit and apply it to the owner's balance.
    ///
    /// Token deposits upsert the (user, mint) balance row; native deposits
    /// credit the cached SOL balance. Balance update, signature index and
    /// status change commit together.
    pub fn settle_deposit(&self, tx_id: Uuid, tx_signature: &str) -> StoreResult<Transaction> {
        self.settle(tx_id, tx_signature, TransactionType::Deposit)
    }

    /// Confirm a pending withdrawal and deduct it from the owner's balance.
    ///
    /// Fails with [`StoreError::InsufficientBalance`] without touching the
    /// row; the caller decides whether to fail the transaction.
    pub fn settle_withdrawal(&self, tx_id: Uuid, tx_signature: &str) -> StoreResult<Transaction> {
        self.settle(tx_id, tx_signature, TransactionType::Withdrawal)
    }

    /// Aggregate transaction counters.
    pub fn transaction_stats(&self) -> StoreResult<TransactionStats> {
        let read_txn = self.db.begin_read()?;
        let txs = read_txn.open_table(TRANSACTIONS)?;

        let mut stats = TransactionStats {
            total_transactions: 0,
            pending: 0,
            failed: 0,
            confirmed_volume: Decimal::ZERO,
        };
        for entry in txs.iter()? {
            let (_, v) = entry?;
            let tx: Transaction = decode(v.value())?;
            stats.total_transactions += 1;
            match tx.status {
                TransactionStatus::Pending => stats.pending += 1,
                TransactionStatus::Failed => stats.failed += 1,
                TransactionStatus::Confirmed => stats.confirmed_volume += tx.amount,
            }
        }

        Ok(stats)
    }

    /// Total fees a user has paid on confirmed transactions.
    pub fn user_total_fees(&self, user_id: Uuid) -> StoreResult<Decimal> {
        let confirmed = TransactionFilter::by_status(TransactionStatus::Confirmed);
        let read_txn = self.db.begin_read()?;
        let by_user = read_txn.open_table(TX_BY_USER)?;
        let txs = read_txn.open_table(TRANSACTIONS)?;

        let (start, end) = prefix_range(&user_id.to_string());
        let mut total = Decimal::ZERO;
        for entry in by_user.range(start.as_str()..end.as_str())? {
            let (_, v) = entry?;
            let tx: Transaction = match txs.get(v.value())? {
                Some(value) => decode(value.value())?,
                None => continue,
            };
            if confirmed.matches(&tx) {
                total += tx.fee;
            }
        }

        Ok(total)
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn settle(
        &self,
        tx_id: Uuid,
        tx_signature: &str,
        expected_type: TransactionType,
    ) -> StoreResult<Transaction> {
        let id_str = tx_id.to_string();

        let write_txn = self.db.begin_write()?;
        let tx = {
            let mut txs = write_txn.open_table(TRANSACTIONS)?;
            let mut by_sig = write_txn.open_table(TX_BY_SIGNATURE)?;
            let mut by_status = write_txn.open_table(TX_BY_STATUS)?;
            let mut balances = write_txn.open_table(TOKEN_BALANCES)?;
            let mut users = write_txn.open_table(USERS)?;

            let mut tx: Transaction = match txs.get(id_str.as_str())? {
                Some(v) => decode(v.value())?,
                None => return Err(StoreError::TransactionNotFound(id_str)),
            };
            if tx.transaction_type != expected_type {
                return Err(StoreError::InvalidInput(format!(
                    "Transaction is not a {expected_type}"
                )));
            }

            let now = Utc::now();
            let sign = match expected_type {
                TransactionType::Deposit => Decimal::ONE,
                _ => Decimal::NEGATIVE_ONE,
            };
            let delta = tx.amount * sign;

            match &tx.token_mint {
                Some(mint) => {
                    let key = balance_key(tx.user_id, mint);
                    let mut row: TokenBalance = match balances.get(key.as_str())? {
                        Some(v) => decode(v.value())?,
                        None => TokenBalance {
                            id: Uuid::new_v4(),
                            user_id: tx.user_id,
                            token_mint: mint.clone(),
                            token_symbol: UNKNOWN_SYMBOL.to_string(),
                            balance: Decimal::ZERO,
                            decimals: UNKNOWN_DECIMALS,
                            created_at: now,
                            updated_at: now,
                        },
                    };
                    if row.balance + delta < Decimal::ZERO {
                        return Err(StoreError::InsufficientBalance {
                            available: row.balance,
                            requested: tx.amount,
                        });
                    }
                    row.balance += delta;
                    row.updated_at = now;
                    balances.insert(key.as_str(), encode(&row)?.as_slice())?;
                }
                None => {
                    let user_key = tx.user_id.to_string();
                    let mut record: UserRecord = match users.get(user_key.as_str())? {
                        Some(v) => decode(v.value())?,
                        None => return Err(StoreError::UserNotFound(user_key)),
                    };
                    if record.balance + delta < Decimal::ZERO {
                        return Err(StoreError::InsufficientBalance {
                            available: record.balance,
                            requested: tx.amount,
                        });
                    }
                    record.balance += delta;
                    record.updated_at = now;
                    users.insert(user_key.as_str(), encode(&record)?.as_slice())?;
                }
            }

            Self::apply_status_change(
                &mut tx,
                TransactionStatus::Confirmed,
                Some(tx_signature),
                &mut txs,
                &mut by_sig,
                &mut by_status,
            )?;
            tx
        };
        write_txn.commit()?;

        tracing::debug!(
            tx_id = %tx.id,
            transaction_type = %tx.transaction_type,
            "Settled transaction"
        );
        Ok(tx)
    }

    /// Apply a lifecycle transition to an already-loaded row inside an open
    /// write transaction, maintaining the signature and status indexes.
    fn apply_status_change(
        tx: &mut Transaction,
        status: TransactionStatus,
        tx_signature: Option<&str>,
        txs: &mut redb::Table<'_, &'static str, &'static [u8]>,
        by_sig: &mut redb::Table<'_, &'static str, &'static str>,
        by_status: &mut redb::Table<'_, &'static str, &'static str>,
    ) -> StoreResult<()> {
        if !tx.status.can_transition_to(status) {
            return Err(StoreError::InvalidStatusTransition {
                from: tx.status,
                to: status,
            });
        }

        let id_str = tx.id.to_string();
        if let Some(sig) = tx_signature {
            let taken_by_other = match by_sig.get(sig)? {
                Some(v) => v.value() != id_str,
                None => false,
            };
            if taken_by_other {
                return Err(StoreError::DuplicateSignature(sig.to_string()));
            }
            if let Some(old_sig) = &tx.tx_signature {
                if old_sig != sig {
                    by_sig.remove(old_sig.as_str())?;
                }
            }
            by_sig.insert(sig, id_str.as_str())?;
            tx.tx_signature = Some(sig.to_string());
        }

        by_status.remove(tx_status_key(tx.status, tx.created_at, tx.id).as_str())?;
        tx.status = status;
        tx.updated_at = Utc::now();
        by_status.insert(
            tx_status_key(tx.status, tx.created_at, tx.id).as_str(),
            id_str.as_str(),
        )?;
        txs.insert(id_str.as_str(), encode(tx)?.as_slice())?;

        Ok(())
    }
}
