#![cfg(any(test, feature = "testing"))]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_lock::RwLock;

use super::{SubscribeOutcome, SubscriptionStore};
use crate::{
    Error, Result,
    notify::NotificationPersistence,
    tracker::{ValidatorPersistence, ValidatorUpdate},
    types::{
        change::{ChangeRecord, PendingChange},
        common::{AddressQuery, ChangeId, NodeAddress, RecipientId, ValidatorId},
        validator::ValidatorRecord,
    },
};

/// Default number of validators one user may watch.
pub const DEFAULT_SUBSCRIPTION_LIMIT: usize = 4;

/// The full contents of a [`MemoryStorage`].
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryDb {
    pub validators: BTreeMap<ValidatorId, ValidatorRecord>,
    pub changes: BTreeMap<ChangeId, ChangeRecord>,
    /// Registered users and their display names.
    pub users: BTreeMap<RecipientId, Option<String>>,
    /// Subscriptions in creation order.
    pub subscriptions: Vec<(RecipientId, ValidatorId)>,
    next_validator: ValidatorId,
    next_change: ChangeId,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self {
            validators: Default::default(),
            changes: Default::default(),
            users: Default::default(),
            subscriptions: Default::default(),
            next_validator: 1,
            next_change: 1,
        }
    }
}

/// Easy-setup storage that just uses memory.
#[derive(Clone, Debug)]
pub struct MemoryStorage {
    db: Arc<RwLock<MemoryDb>>,
    fail_next: Arc<AtomicBool>,
    subscription_limit: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_LIMIT)
    }
}

impl MemoryStorage {
    pub fn new(subscription_limit: usize) -> Self {
        Self {
            db: Default::default(),
            fail_next: Arc::new(false.into()),
            subscription_limit,
        }
    }

    /// Cause the next operation to fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// A full snapshot of the contents of a mock database.
    ///
    /// This can be used for checking equality between different databases.
    pub async fn cmp_key(&self) -> MemoryDb {
        self.db.read().await.clone()
    }

    fn mock_errors(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::internal().context("mock error"));
        }
        Ok(())
    }
}

impl ValidatorPersistence for MemoryStorage {
    async fn validator(&self, node: &NodeAddress) -> Result<Option<ValidatorRecord>> {
        self.mock_errors()?;
        Ok(self
            .db
            .read()
            .await
            .validators
            .values()
            .find(|v| &v.node_address == node)
            .cloned())
    }

    async fn subscriber_count(&self, validator: ValidatorId) -> Result<usize> {
        self.mock_errors()?;
        Ok(self
            .db
            .read()
            .await
            .subscriptions
            .iter()
            .filter(|(_, v)| *v == validator)
            .count())
    }

    async fn store_update(&self, update: ValidatorUpdate) -> Result<(ValidatorId, Vec<ChangeId>)> {
        self.mock_errors()?;
        let db = &mut *self.db.write().await;

        let id = match update.existing {
            Some(id) => {
                if !db.validators.contains_key(&id) {
                    return Err(Error::internal().context(format!("validator {id} does not exist")));
                }
                id
            }
            None => {
                let id = db.next_validator;
                db.next_validator += 1;
                id
            }
        };
        db.validators
            .insert(id, ValidatorRecord::from_snapshot(id, &update.snapshot));

        let mut changes = vec![];
        for change in update.changes {
            let change_id = db.next_change;
            db.next_change += 1;
            db.changes.insert(
                change_id,
                ChangeRecord {
                    id: change_id,
                    validator_id: id,
                    change,
                    detected_at: update.detected_at,
                    sent: false,
                },
            );
            changes.push(change_id);
        }
        Ok((id, changes))
    }
}

impl NotificationPersistence for MemoryStorage {
    async fn unsent_changes(&self) -> Result<Vec<PendingChange>> {
        self.mock_errors()?;
        let db = self.db.read().await;
        let mut pending = db
            .changes
            .values()
            .filter(|change| !change.sent)
            .map(|change| {
                let validator = db.validators.get(&change.validator_id).ok_or_else(|| {
                    Error::internal().context(format!(
                        "change {} refers to missing validator {}",
                        change.id, change.validator_id
                    ))
                })?;
                Ok(PendingChange {
                    record: change.clone(),
                    validator_address: validator.validator_address.clone(),
                    node_address: validator.node_address.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        pending.sort_by_key(|change| (change.record.detected_at, change.record.id));
        Ok(pending)
    }

    async fn subscribers(&self, validator: ValidatorId) -> Result<Vec<RecipientId>> {
        self.mock_errors()?;
        Ok(self
            .db
            .read()
            .await
            .subscriptions
            .iter()
            .filter(|(_, v)| *v == validator)
            .map(|(recipient, _)| recipient.clone())
            .collect())
    }

    async fn mark_sent(&self, change: ChangeId) -> Result<()> {
        self.mock_errors()?;
        let mut db = self.db.write().await;
        let record = db
            .changes
            .get_mut(&change)
            .ok_or_else(|| Error::internal().context(format!("change {change} does not exist")))?;
        record.sent = true;
        Ok(())
    }
}

impl SubscriptionStore for MemoryStorage {
    async fn ensure_user(&self, recipient: &RecipientId, name: Option<&str>) -> Result<()> {
        self.mock_errors()?;
        self.db
            .write()
            .await
            .users
            .insert(recipient.clone(), name.map(String::from));
        Ok(())
    }

    async fn subscribe(
        &self,
        recipient: &RecipientId,
        validator: ValidatorId,
    ) -> Result<SubscribeOutcome> {
        self.mock_errors()?;
        let db = &mut *self.db.write().await;
        if !db.validators.contains_key(&validator) {
            return Err(Error::internal().context(format!("validator {validator} does not exist")));
        }
        db.users.entry(recipient.clone()).or_default();

        let mut count = 0;
        for (r, v) in &db.subscriptions {
            if r == recipient {
                if *v == validator {
                    return Ok(SubscribeOutcome::AlreadySubscribed);
                }
                count += 1;
            }
        }
        if count >= self.subscription_limit {
            return Ok(SubscribeOutcome::LimitReached);
        }
        db.subscriptions.push((recipient.clone(), validator));
        Ok(SubscribeOutcome::Created)
    }

    async fn unsubscribe(&self, recipient: &RecipientId, validator: ValidatorId) -> Result<bool> {
        self.mock_errors()?;
        let subscriptions = &mut self.db.write().await.subscriptions;
        let before = subscriptions.len();
        subscriptions.retain(|(r, v)| !(r == recipient && *v == validator));
        Ok(subscriptions.len() < before)
    }

    async fn unsubscribe_all(&self, recipient: &RecipientId) -> Result<usize> {
        self.mock_errors()?;
        let subscriptions = &mut self.db.write().await.subscriptions;
        let before = subscriptions.len();
        subscriptions.retain(|(r, _)| r != recipient);
        Ok(before - subscriptions.len())
    }

    async fn subscriptions_of(&self, recipient: &RecipientId) -> Result<Vec<ValidatorRecord>> {
        self.mock_errors()?;
        let db = self.db.read().await;
        Ok(db
            .subscriptions
            .iter()
            .filter(|(r, _)| r == recipient)
            .filter_map(|(_, v)| db.validators.get(v).cloned())
            .collect())
    }

    async fn validator_by_address(&self, query: &AddressQuery) -> Result<Option<ValidatorRecord>> {
        self.mock_errors()?;
        Ok(self
            .db
            .read()
            .await
            .validators
            .values()
            .find(|v| match query {
                AddressQuery::Validator(addr) => &v.validator_address == addr,
                AddressQuery::Node(addr) => &v.node_address == addr,
            })
            .cloned())
    }
}
