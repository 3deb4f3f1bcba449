//! Keyshare operations.
//!
//! One share per (user, MPC node) pair. Strict inserts reject duplicates;
//! `upsert_keyshare` and `rotate_keyshare` cover key refresh.

use std::collections::HashSet;

use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::{Keyshare, KeyshareStats, NewKeyshare, SecretShare};

use super::redb::{KEYSHARES, Store, USERS, decode, encode, keyshare_key, prefix_range};

impl Store {
    /// Insert a keyshare for a (user, node) pair.
    ///
    /// Fails with [`StoreError::KeyshareExists`] if the pair already holds a
    /// share, and with [`StoreError::UserNotFound`] if the owner is absent.
    pub fn insert_keyshare(&self, request: NewKeyshare) -> StoreResult<Keyshare> {
        self.put_keyshare(request, false)
    }

    /// Insert or replace the keyshare for a (user, node) pair (key refresh).
    ///
    /// An existing row keeps its id and creation time.
    pub fn upsert_keyshare(&self, request: NewKeyshare) -> StoreResult<Keyshare> {
        self.put_keyshare(request, true)
    }

    /// Get the keyshare held by one node for one user.
    pub fn keyshare(&self, user_id: Uuid, mpc_node_id: u16) -> StoreResult<Keyshare> {
        self.validate_node(mpc_node_id)?;

        let key = keyshare_key(user_id, mpc_node_id);
        let read_txn = self.db.begin_read()?;
        let keyshares = read_txn.open_table(KEYSHARES)?;

        match keyshares.get(key.as_str())? {
            Some(v) => decode(v.value()),
            None => Err(StoreError::KeyshareNotFound {
                user_id,
                mpc_node_id,
            }),
        }
    }

    /// All keyshares for one user, ordered by node id.
    pub fn user_keyshares(&self, user_id: Uuid) -> StoreResult<Vec<Keyshare>> {
        let read_txn = self.db.begin_read()?;
        let keyshares = read_txn.open_table(KEYSHARES)?;

        let (start, end) = prefix_range(&user_id.to_string());
        let mut shares: Vec<Keyshare> = Vec::new();
        for entry in keyshares.range(start.as_str()..end.as_str())? {
            let (_, v) = entry?;
            shares.push(decode(v.value())?);
        }

        // Keys are ordered by zero-padded node id already
        Ok(shares)
    }

    /// All keyshares held by one node, ordered by creation time.
    pub fn node_keyshares(&self, mpc_node_id: u16) -> StoreResult<Vec<Keyshare>> {
        self.validate_node(mpc_node_id)?;

        let read_txn = self.db.begin_read()?;
        let keyshares = read_txn.open_table(KEYSHARES)?;

        let mut shares: Vec<Keyshare> = Vec::new();
        for entry in keyshares.iter()? {
            let (_, v) = entry?;
            let share: Keyshare = decode(v.value())?;
            if share.mpc_node_id == mpc_node_id {
                shares.push(share);
            }
        }
        shares.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(shares)
    }

    /// Replace the share payload for a (user, node) pair.
    pub fn rotate_keyshare(
        &self,
        user_id: Uuid,
        mpc_node_id: u16,
        new_share: SecretShare,
    ) -> StoreResult<()> {
        self.validate_node(mpc_node_id)?;

        let key = keyshare_key(user_id, mpc_node_id);
        let write_txn = self.db.begin_write()?;
        {
            let mut keyshares = write_txn.open_table(KEYSHARES)?;

            let mut share: Keyshare = match keyshares.get(key.as_str())? {
                Some(v) => decode(v.value())?,
                None => {
                    return Err(StoreError::KeyshareNotFound {
                        user_id,
                        mpc_node_id,
                    });
                }
            };

            share.private_key_share = new_share;
            share.updated_at = Utc::now();
            keyshares.insert(key.as_str(), encode(&share)?.as_slice())?;
        }
        write_txn.commit()?;

        tracing::debug!(user_id = %user_id, mpc_node_id, "Rotated keyshare");
        Ok(())
    }

    /// Whether a user holds enough shares to reach the signing quorum.
    ///
    /// Uses the configured default threshold when `required` is unset.
    pub fn has_quorum(&self, user_id: Uuid, required: Option<u16>) -> StoreResult<bool> {
        let threshold = required.unwrap_or(self.policy.threshold);
        let count = self.user_keyshares(user_id)?.len();
        Ok(count >= threshold as usize)
    }

    /// Aggregate keyshare counts for monitoring.
    pub fn keyshare_stats(&self) -> StoreResult<KeyshareStats> {
        let read_txn = self.db.begin_read()?;
        let keyshares = read_txn.open_table(KEYSHARES)?;

        let mut total = 0u64;
        let mut users: HashSet<Uuid> = HashSet::new();
        let mut nodes: HashSet<u16> = HashSet::new();
        for entry in keyshares.iter()? {
            let (_, v) = entry?;
            let share: Keyshare = decode(v.value())?;
            total += 1;
            users.insert(share.user_id);
            nodes.insert(share.mpc_node_id);
        }

        Ok(KeyshareStats {
            total_keyshares: total,
            users_with_shares: users.len() as u64,
            active_nodes: nodes.len() as u64,
        })
    }

    fn put_keyshare(&self, request: NewKeyshare, replace: bool) -> StoreResult<Keyshare> {
        self.validate_node(request.mpc_node_id)?;

        let threshold = request.threshold.unwrap_or(self.policy.threshold);
        let total_shares = request.total_shares.unwrap_or(self.policy.total_shares);
        if threshold == 0 || threshold > total_shares {
            return Err(StoreError::InvalidThreshold {
                threshold,
                total: total_shares,
            });
        }

        let key = keyshare_key(request.user_id, request.mpc_node_id);
        let now = Utc::now();

        let write_txn = self.db.begin_write()?;
        let share = {
            let users = write_txn.open_table(USERS)?;
            if users.get(request.user_id.to_string().as_str())?.is_none() {
                return Err(StoreError::UserNotFound(request.user_id.to_string()));
            }

            let mut keyshares = write_txn.open_table(KEYSHARES)?;
            let existing: Option<Keyshare> = match keyshares.get(key.as_str())? {
                Some(v) => Some(decode(v.value())?),
                None => None,
            };

            let share = match existing {
                Some(_) if !replace => {
                    return Err(StoreError::KeyshareExists {
                        user_id: request.user_id,
                        mpc_node_id: request.mpc_node_id,
                    });
                }
                Some(mut existing) => {
                    existing.private_key_share = request.private_key_share;
                    existing.public_key = request.public_key;
                    existing.threshold = threshold;
                    existing.total_shares = total_shares;
                    existing.updated_at = now;
                    existing
                }
                None => Keyshare {
                    id: Uuid::new_v4(),
                    user_id: request.user_id,
                    mpc_node_id: request.mpc_node_id,
                    private_key_share: request.private_key_share,
                    public_key: request.public_key,
                    threshold,
                    total_shares,
                    created_at: now,
                    updated_at: now,
                },
            };

            keyshares.insert(key.as_str(), encode(&share)?.as_slice())?;
            share
        };
        write_txn.commit()?;

        tracing::debug!(
            user_id = %share.user_id,
            mpc_node_id = share.mpc_node_id,
            "Stored keyshare"
        );
        Ok(share)
    }

    fn validate_node(&self, mpc_node_id: u16) -> StoreResult<()> {
        if mpc_node_id == 0 || mpc_node_id > self.policy.nodes {
            return Err(StoreError::InvalidNodeId {
                node: mpc_node_id,
                max: self.policy.nodes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewUser;

    fn store_with_user() -> (Store, Uuid) {
        let store = Store::open_memory().unwrap();
        let user = store
            .create_user(NewUser {
                email: "shares@example.com".to_string(),
                password: "hunter2-hunter2".to_string(),
            })
            .unwrap();
        (store, user.id)
    }

    fn share_request(user_id: Uuid, node: u16) -> NewKeyshare {
        NewKeyshare {
            user_id,
            mpc_node_id: node,
            private_key_share: SecretShare::new(format!("encrypted-share-{node}")),
            public_key: "group-pubkey".to_string(),
            threshold: None,
            total_shares: None,
        }
    }

    #[test]
    fn test_insert_and_get_keyshare() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        let share = store.insert_keyshare(share_request(user_id, 1))?;
        assert_eq!(share.threshold, 2);
        assert_eq!(share.total_shares, 3);

        let loaded = store.keyshare(user_id, 1)?;
        assert_eq!(loaded.id, share.id);
        assert_eq!(loaded.private_key_share.expose(), "encrypted-share-1");

        Ok(())
    }

    #[test]
    fn test_duplicate_pair_rejected() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        store.insert_keyshare(share_request(user_id, 1))?;
        let err = store.insert_keyshare(share_request(user_id, 1)).unwrap_err();
        assert!(matches!(err, StoreError::KeyshareExists { .. }));

        // A different node for the same user is fine
        store.insert_keyshare(share_request(user_id, 2))?;
        Ok(())
    }

    #[test]
    fn test_upsert_replaces_share() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        let original = store.insert_keyshare(share_request(user_id, 1))?;
        let mut refresh = share_request(user_id, 1);
        refresh.private_key_share = SecretShare::new("refreshed-share");
        let replaced = store.upsert_keyshare(refresh)?;

        assert_eq!(replaced.id, original.id);
        assert_eq!(replaced.created_at, original.created_at);
        assert_eq!(replaced.private_key_share.expose(), "refreshed-share");
        assert_eq!(store.user_keyshares(user_id)?.len(), 1);

        Ok(())
    }

    #[test]
    fn test_node_and_threshold_validation() {
        let (store, user_id) = store_with_user();

        let err = store.insert_keyshare(share_request(user_id, 0)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidNodeId { .. }));

        let err = store.insert_keyshare(share_request(user_id, 9)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidNodeId { node: 9, max: 5 }));

        let mut bad = share_request(user_id, 1);
        bad.threshold = Some(4);
        bad.total_shares = Some(3);
        let err = store.insert_keyshare(bad).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidThreshold {
                threshold: 4,
                total: 3
            }
        ));
    }

    #[test]
    fn test_keyshare_requires_existing_user() {
        let store = Store::open_memory().unwrap();
        let err = store
            .insert_keyshare(share_request(Uuid::new_v4(), 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
    }

    #[test]
    fn test_user_keyshares_ordered_by_node() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        store.insert_keyshare(share_request(user_id, 3))?;
        store.insert_keyshare(share_request(user_id, 1))?;
        store.insert_keyshare(share_request(user_id, 2))?;

        let nodes: Vec<u16> = store
            .user_keyshares(user_id)?
            .iter()
            .map(|s| s.mpc_node_id)
            .collect();
        assert_eq!(nodes, vec![1, 2, 3]);

        Ok(())
    }

    #[test]
    fn test_node_keyshares_filters_by_node() -> StoreResult<()> {
        let (store, alice) = store_with_user();
        let bob = store
            .create_user(NewUser {
                email: "bob-shares@example.com".to_string(),
                password: "hunter2-hunter2".to_string(),
            })?
            .id;

        store.insert_keyshare(share_request(alice, 1))?;
        store.insert_keyshare(share_request(alice, 2))?;
        store.insert_keyshare(share_request(bob, 1))?;

        let node1 = store.node_keyshares(1)?;
        assert_eq!(node1.len(), 2);
        assert!(node1.iter().all(|s| s.mpc_node_id == 1));

        Ok(())
    }

    #[test]
    fn test_rotate_keyshare() -> StoreResult<()> {
        let (store, user_id) = store_with_user();
        store.insert_keyshare(share_request(user_id, 1))?;

        store.rotate_keyshare(user_id, 1, SecretShare::new("rotated"))?;
        assert_eq!(store.keyshare(user_id, 1)?.private_key_share.expose(), "rotated");

        let err = store
            .rotate_keyshare(user_id, 2, SecretShare::new("nope"))
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyshareNotFound { .. }));

        Ok(())
    }

    #[test]
    fn test_quorum_and_stats() -> StoreResult<()> {
        let (store, user_id) = store_with_user();

        assert!(!store.has_quorum(user_id, None)?);
        store.insert_keyshare(share_request(user_id, 1))?;
        assert!(!store.has_quorum(user_id, None)?);
        store.insert_keyshare(share_request(user_id, 2))?;
        assert!(store.has_quorum(user_id, None)?);
        assert!(!store.has_quorum(user_id, Some(3))?);

        let stats = store.keyshare_stats()?;
        assert_eq!(stats.total_keyshares, 2);
        assert_eq!(stats.users_with_shares, 1);
        assert_eq!(stats.active_nodes, 2);

        Ok(())
    }
}
