//! Integration tests for the custody store.
//!
//! These tests exercise full user/keyshare/balance/transaction flows against
//! temporary file-based databases, including closing and reopening the store.
//!
//! Run with: cargo test --test `store_integration`

use rust_decimal::Decimal;
use tempfile::TempDir;

use custody_store::{
    NewKeyshare, NewTransaction, NewUser, Settings, Store, StoreError, TransactionFilter,
    TransactionStatus, TransactionType,
};

const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// Create a test store backed by a temporary file.
fn create_test_store(temp_dir: &TempDir) -> Store {
    let db_path = temp_dir.path().join("custody.redb");
    Store::open(&db_path, &Settings::for_tests()).expect("Failed to open store")
}

fn signup(store: &Store, email: &str) -> custody_store::User {
    store
        .create_user(NewUser {
            email: email.to_string(),
            password: "correct-horse-battery".to_string(),
        })
        .expect("Failed to create user")
}

#[test]
fn full_deposit_and_withdrawal_flow() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir);

    let user = signup(&store, "alice@example.com");

    // Deposit 100 SOL: record pending, then settle
    let deposit = store
        .record_transaction(NewTransaction::new(
            user.id,
            TransactionType::Deposit,
            Decimal::new(100, 0),
        ))
        .unwrap();
    assert_eq!(deposit.status, TransactionStatus::Pending);

    store.settle_deposit(deposit.id, "deposit-sig").unwrap();
    assert_eq!(store.sol_balance(user.id).unwrap(), Decimal::new(100, 0));

    // Withdraw 40 SOL
    let withdrawal = store
        .record_transaction(NewTransaction::new(
            user.id,
            TransactionType::Withdrawal,
            Decimal::new(40, 0),
        ))
        .unwrap();
    store
        .settle_withdrawal(withdrawal.id, "withdrawal-sig")
        .unwrap();
    assert_eq!(store.sol_balance(user.id).unwrap(), Decimal::new(60, 0));

    // Both show up confirmed, newest first
    let history = store
        .user_transactions(user.id, TransactionFilter::default(), 10, 0)
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(
        history
            .iter()
            .all(|tx| tx.status == TransactionStatus::Confirmed)
    );

    let stats = store.transaction_stats().unwrap();
    assert_eq!(stats.total_transactions, 2);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.confirmed_volume, Decimal::new(140, 0));
}

#[test]
fn token_balance_upsert_keeps_single_row() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir);
    let user = signup(&store, "bob@example.com");

    store
        .upsert_token_balance(user.id, USDC, "USDC", Decimal::new(100, 0), 6)
        .unwrap();
    store
        .upsert_token_balance(user.id, USDC, "USDC", Decimal::new(50, 0), 6)
        .unwrap();

    // Upsert replaces; there is exactly one row at the latest amount
    let balances = store.user_token_balances(user.id).unwrap();
    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].balance, Decimal::new(50, 0));
    assert_eq!(store.token_balance(user.id, USDC).unwrap(), Decimal::new(50, 0));
}

#[test]
fn duplicate_signature_rejected_across_users() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir);
    let alice = signup(&store, "alice@example.com");
    let bob = signup(&store, "bob@example.com");

    let mut first = NewTransaction::new(alice.id, TransactionType::Deposit, Decimal::ONE);
    first.tx_signature = Some("sig1".to_string());
    store.record_transaction(first).unwrap();

    let mut second = NewTransaction::new(bob.id, TransactionType::Deposit, Decimal::ONE);
    second.tx_signature = Some("sig1".to_string());
    let err = store.record_transaction(second).unwrap_err();
    assert!(matches!(err, StoreError::DuplicateSignature(_)));
}

#[test]
fn keyshare_quorum_across_nodes() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir);
    let user = signup(&store, "carol@example.com");

    for node in 1..=2u16 {
        store
            .insert_keyshare(NewKeyshare {
                user_id: user.id,
                mpc_node_id: node,
                private_key_share: format!("share-{node}").into(),
                public_key: "pubkey".to_string(),
                threshold: None,
                total_shares: None,
            })
            .expect("Failed to insert keyshare");
    }

    // Default policy is 2-of-3
    assert!(store.has_quorum(user.id, None).unwrap());
    assert!(!store.has_quorum(user.id, Some(3)).unwrap());

    let shares = store.user_keyshares(user.id).unwrap();
    assert_eq!(shares.len(), 2);
    assert_eq!(shares[0].mpc_node_id, 1);
    assert_eq!(shares[1].mpc_node_id, 2);
}

#[test]
fn delete_user_cascades_everything() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir);
    let user = signup(&store, "dave@example.com");
    let survivor = signup(&store, "eve@example.com");

    store
        .insert_keyshare(NewKeyshare {
            user_id: user.id,
            mpc_node_id: 1,
            private_key_share: "share".into(),
            public_key: "pubkey".to_string(),
            threshold: None,
            total_shares: None,
        })
        .unwrap();
    store
        .upsert_token_balance(user.id, USDC, "USDC", Decimal::new(10, 0), 6)
        .unwrap();
    let mut tx = NewTransaction::new(user.id, TransactionType::Deposit, Decimal::ONE);
    tx.tx_signature = Some("cascade-sig".to_string());
    store.record_transaction(tx).unwrap();

    let mut survivor_tx =
        NewTransaction::new(survivor.id, TransactionType::Deposit, Decimal::ONE);
    survivor_tx.tx_signature = Some("survivor-sig".to_string());
    store.record_transaction(survivor_tx).unwrap();

    store.delete_user(user.id).unwrap();

    assert!(matches!(
        store.user(user.id).unwrap_err(),
        StoreError::UserNotFound(_)
    ));
    assert!(store.user_keyshares(user.id).unwrap().is_empty());
    assert!(store.user_token_balances(user.id).unwrap().is_empty());
    assert_eq!(
        store
            .count_user_transactions(user.id, TransactionFilter::default())
            .unwrap(),
        0
    );

    // The deleted user's signature is free again, the survivor's is not
    let mut reuse = NewTransaction::new(survivor.id, TransactionType::Deposit, Decimal::ONE);
    reuse.tx_signature = Some("cascade-sig".to_string());
    store.record_transaction(reuse).unwrap();

    assert_eq!(store.count_users().unwrap(), 1);
    assert_eq!(
        store
            .count_user_transactions(survivor.id, TransactionFilter::default())
            .unwrap(),
        2
    );
}

#[test]
fn reopen_preserves_data() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("custody.redb");

    let user_id = {
        let store = Store::open(&db_path, &Settings::for_tests()).unwrap();
        let user = signup(&store, "frank@example.com");
        store
            .upsert_token_balance(user.id, USDC, "USDC", Decimal::new(75, 0), 6)
            .unwrap();
        let tx = store
            .record_transaction(NewTransaction::new(
                user.id,
                TransactionType::Deposit,
                Decimal::new(5, 0),
            ))
            .unwrap();
        store.settle_deposit(tx.id, "persisted-sig").unwrap();
        user.id
    };

    let store = Store::open(&db_path, &Settings::for_tests()).unwrap();
    let user = store.user(user_id).unwrap();
    assert_eq!(user.email, "frank@example.com");
    assert_eq!(user.balance, Decimal::new(5, 0));
    assert_eq!(store.token_balance(user_id, USDC).unwrap(), Decimal::new(75, 0));
    assert_eq!(
        store
            .transaction_by_signature("persisted-sig")
            .unwrap()
            .status,
        TransactionStatus::Confirmed
    );

    // Password verification survives the reopen
    let verified = store
        .verify_password("frank@example.com", "correct-horse-battery")
        .unwrap();
    assert_eq!(verified.id, user_id);
    assert!(matches!(
        store.verify_password("frank@example.com", "wrong").unwrap_err(),
        StoreError::InvalidCredentials
    ));
}

#[test]
fn transfer_between_users_is_atomic() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir);
    let alice = signup(&store, "alice@example.com");
    let bob = signup(&store, "bob@example.com");

    store
        .upsert_token_balance(alice.id, USDC, "USDC", Decimal::new(100, 0), 6)
        .unwrap();

    store
        .transfer_token(alice.id, bob.id, USDC, Decimal::new(30, 0))
        .unwrap();
    assert_eq!(store.token_balance(alice.id, USDC).unwrap(), Decimal::new(70, 0));
    assert_eq!(store.token_balance(bob.id, USDC).unwrap(), Decimal::new(30, 0));

    // Overdraft leaves both sides untouched
    let err = store
        .transfer_token(alice.id, bob.id, USDC, Decimal::new(500, 0))
        .unwrap_err();
    assert!(matches!(err, StoreError::InsufficientBalance { .. }));
    assert_eq!(store.token_balance(alice.id, USDC).unwrap(), Decimal::new(70, 0));
    assert_eq!(store.token_balance(bob.id, USDC).unwrap(), Decimal::new(30, 0));
}
