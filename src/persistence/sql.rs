//! SQL-based persistent storage
use crate::{
    Error, Result,
    error::{ResultExt, ensure},
    notify::NotificationPersistence,
    tracker::{ValidatorPersistence, ValidatorUpdate},
    types::{
        change::{AttributeKind, AttributeValue, ChangeRecord, DetectedChange, PendingChange},
        common::{AddressQuery, ChangeId, NodeAddress, RecipientId, ValidatorId, now},
        validator::{CommissionInfo, ValidatorMetadata, ValidatorRecord},
    },
};
use clap::Parser;
use sqlx::{
    ConnectOptions,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
};
use std::{path::PathBuf, str::FromStr};
use tracing::{instrument, log::LevelFilter};

use super::{SubscribeOutcome, SubscriptionStore};

/// Options for persistence.
#[derive(Parser, Clone, Debug)]
pub struct PersistenceOptions {
    /// Path to the SQLite database file.
    ///
    /// If the file does not exist, it will be created.
    /// The parent directory must exist.
    #[clap(long = "db-path", env = "VALIDATOR_WATCH_DB_PATH")]
    pub path: PathBuf,

    /// Maximum number of connections in the connection pool.
    #[clap(
        long = "db-max-connections",
        env = "VALIDATOR_WATCH_DB_MAX_CONNECTIONS",
        default_value = "10"
    )]
    pub max_connections: u32,

    /// Maximum number of validators a single user may subscribe to.
    #[clap(
        long,
        env = "VALIDATOR_WATCH_SUBSCRIPTION_LIMIT",
        default_value = "4"
    )]
    pub subscription_limit: usize,
}

/// Columns of a validator row, in the order [`ValidatorRow`] expects. The table is aliased `v`.
const VALIDATOR_COLUMNS: &str = "v.id, v.node_address, v.validator_address, v.voting_power, \
     v.email, v.description, v.website, v.discord_handle, v.avatar, \
     v.commission_rate, v.max_commission_change, v.state";

type ValidatorRow = (
    i64,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    f64,
    f64,
    String,
);

fn validator_from_row(row: ValidatorRow) -> Result<ValidatorRecord> {
    let (
        id,
        node_address,
        validator_address,
        voting_power,
        email,
        description,
        website,
        discord_handle,
        avatar,
        rate,
        max_change_per_epoch,
        state,
    ) = row;
    let corrupt = |field: &'static str| {
        move || Error::internal().context(format!("validator {id} has invalid stored {field}"))
    };
    Ok(ValidatorRecord {
        id,
        node_address: node_address.parse().context(corrupt("node address"))?,
        validator_address: validator_address
            .parse()
            .context(corrupt("validator address"))?,
        voting_power: voting_power
            .try_into()
            .context(corrupt("voting power"))?,
        metadata: ValidatorMetadata {
            email,
            description,
            website,
            discord_handle,
            avatar,
        },
        commission: CommissionInfo {
            rate,
            max_change_per_epoch,
        },
        state: state.parse().context(corrupt("state"))?,
    })
}

type ChangeRow = (i64, i64, String, String, String, i64, bool, String, String);

fn pending_from_row(row: ChangeRow) -> Result<PendingChange> {
    let (
        id,
        validator_id,
        kind,
        previous,
        new,
        detected_at,
        sent,
        validator_address,
        node_address,
    ) = row;
    let corrupt = || Error::internal().context(format!("change {id} is corrupt"));
    let kind: AttributeKind = kind.parse().context(corrupt)?;
    Ok(PendingChange {
        record: ChangeRecord {
            id,
            validator_id,
            change: DetectedChange {
                previous: AttributeValue::from_storage(kind, &previous).context(corrupt)?,
                new: AttributeValue::from_storage(kind, &new).context(corrupt)?,
            },
            detected_at,
            sent,
        },
        validator_address: validator_address.parse().context(corrupt)?,
        node_address: node_address.parse().context(corrupt)?,
    })
}

#[derive(Debug, Clone)]
pub struct Persistence {
    pool: SqlitePool,
    subscription_limit: usize,
}

impl Persistence {
    /// Open the connection pool described by `options`.
    ///
    /// The pool is an owned handle; clones share the same connections.
    pub async fn connect(options: &PersistenceOptions) -> Result<SqlitePool> {
        let path = options
            .path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("invalid path {}", options.path.display()))?;
        let connect_options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .log_statements(LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await?;
        Ok(pool)
    }

    /// Wrap a connection pool, bringing the schema up to date.
    pub async fn new(pool: SqlitePool, subscription_limit: usize) -> Result<Self> {
        Self::run_migrations(&pool).await?;

        tracing::info!("SQLite persistence initialized successfully");
        Ok(Self {
            pool,
            subscription_limit,
        })
    }

    /// Connect and migrate in one step.
    pub async fn open(options: &PersistenceOptions) -> Result<Self> {
        let pool = Self::connect(options).await?;
        Self::new(pool, options.subscription_limit).await
    }

    /// Run database migrations using SQLx's migration system
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        tracing::warn!("running database migrations");

        sqlx::migrate!("./migrations/sqlite")
            .run(pool)
            .await
            .map_err(|err| Error::from(err).context("failed to run migrations"))?;

        tracing::warn!("migrations completed");
        Ok(())
    }

    /// Number of change records still waiting for delivery.
    pub async fn unsent_count(&self) -> Result<usize> {
        let (count,) =
            sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM change_record WHERE NOT sent")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    /// Number of tracked validators.
    pub async fn validator_count(&self) -> Result<usize> {
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM validator")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

impl ValidatorPersistence for Persistence {
    async fn validator(&self, node: &NodeAddress) -> Result<Option<ValidatorRecord>> {
        let sql = format!("SELECT {VALIDATOR_COLUMNS} FROM validator AS v WHERE v.node_address = $1");
        sqlx::query_as::<_, ValidatorRow>(&sql)
            .bind(node.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(validator_from_row)
            .transpose()
    }

    async fn subscriber_count(&self, validator: ValidatorId) -> Result<usize> {
        let (count,) =
            sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM subscription WHERE validator_id = $1")
                .bind(validator)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    #[instrument(skip_all, fields(node_address = %update.snapshot.node_address))]
    async fn store_update(&self, update: ValidatorUpdate) -> Result<(ValidatorId, Vec<ChangeId>)> {
        let snapshot = &update.snapshot;
        let voting_power = i64::try_from(snapshot.voting_power).context(|| {
            Error::internal().context(format!("voting power {} too large", snapshot.voting_power))
        })?;

        let mut tx = self.pool.begin().await?;

        // The row is keyed by node address, so an existing validator keeps its id.
        let (id,) = sqlx::query_as::<_, (i64,)>(
            "INSERT INTO validator (
                node_address, validator_address, voting_power, email, description, website,
                discord_handle, avatar, commission_rate, max_commission_change, state, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (node_address) DO UPDATE SET
                validator_address     = excluded.validator_address,
                voting_power          = excluded.voting_power,
                email                 = excluded.email,
                description           = excluded.description,
                website               = excluded.website,
                discord_handle        = excluded.discord_handle,
                avatar                = excluded.avatar,
                commission_rate       = excluded.commission_rate,
                max_commission_change = excluded.max_commission_change,
                state                 = excluded.state,
                updated_at            = excluded.updated_at
            RETURNING id",
        )
        .bind(snapshot.node_address.as_str())
        .bind(snapshot.validator_address.as_str())
        .bind(voting_power)
        .bind(&snapshot.metadata.email)
        .bind(snapshot.metadata.description.as_deref())
        .bind(snapshot.metadata.website.as_deref())
        .bind(snapshot.metadata.discord_handle.as_deref())
        .bind(snapshot.metadata.avatar.as_deref())
        .bind(snapshot.commission.rate)
        .bind(snapshot.commission.max_change_per_epoch)
        .bind(snapshot.state.as_str())
        .bind(update.detected_at)
        .fetch_one(&mut *tx)
        .await?;
        if let Some(existing) = update.existing {
            ensure!(
                existing == id,
                Error::internal().context(format!(
                    "node address belongs to validator {id}, not {existing}"
                ))
            );
        }

        let mut changes = Vec::with_capacity(update.changes.len());
        for change in &update.changes {
            let (change_id,) = sqlx::query_as::<_, (i64,)>(
                "INSERT INTO change_record
                    (validator_id, attribute_kind, previous_value, new_value, detected_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id",
            )
            .bind(id)
            .bind(change.kind().as_str())
            .bind(change.previous.to_storage())
            .bind(change.new.to_storage())
            .bind(update.detected_at)
            .fetch_one(&mut *tx)
            .await?;
            changes.push(change_id);
        }

        tx.commit().await?;
        Ok((id, changes))
    }
}

impl NotificationPersistence for Persistence {
    async fn unsent_changes(&self) -> Result<Vec<PendingChange>> {
        sqlx::query_as::<_, ChangeRow>(
            "SELECT c.id, c.validator_id, c.attribute_kind, c.previous_value, c.new_value,
                    c.detected_at, c.sent, v.validator_address, v.node_address
               FROM change_record AS c
               JOIN validator AS v ON v.id = c.validator_id
              WHERE NOT c.sent
              ORDER BY c.detected_at, c.id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(pending_from_row)
        .collect()
    }

    async fn subscribers(&self, validator: ValidatorId) -> Result<Vec<RecipientId>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT s.chat_id
               FROM subscription AS sub
               JOIN subscriber AS s ON s.id = sub.subscriber_id
              WHERE sub.validator_id = $1
              ORDER BY sub.id",
        )
        .bind(validator)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(chat_id,)| chat_id).collect())
    }

    async fn mark_sent(&self, change: ChangeId) -> Result<()> {
        let res = sqlx::query("UPDATE change_record SET sent = TRUE WHERE id = $1")
            .bind(change)
            .execute(&self.pool)
            .await?;
        ensure!(
            res.rows_affected() == 1,
            Error::internal().context(format!("change {change} does not exist"))
        );
        Ok(())
    }
}

impl SubscriptionStore for Persistence {
    async fn ensure_user(&self, recipient: &RecipientId, name: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriber (chat_id, name, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (chat_id) DO UPDATE SET name = excluded.name",
        )
        .bind(recipient)
        .bind(name)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        recipient: &RecipientId,
        validator: ValidatorId,
    ) -> Result<SubscribeOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO subscriber (chat_id, created_at) VALUES ($1, $2)
             ON CONFLICT (chat_id) DO NOTHING",
        )
        .bind(recipient)
        .bind(now())
        .execute(&mut *tx)
        .await?;
        let (user,) = sqlx::query_as::<_, (i64,)>("SELECT id FROM subscriber WHERE chat_id = $1")
            .bind(recipient)
            .fetch_one(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, (i64,)>(
            "SELECT validator_id FROM subscription WHERE subscriber_id = $1",
        )
        .bind(user)
        .fetch_all(&mut *tx)
        .await?;
        let outcome = if existing.iter().any(|(v,)| *v == validator) {
            SubscribeOutcome::AlreadySubscribed
        } else if existing.len() >= self.subscription_limit {
            SubscribeOutcome::LimitReached
        } else {
            sqlx::query(
                "INSERT INTO subscription (subscriber_id, validator_id, created_at)
                 VALUES ($1, $2, $3)",
            )
            .bind(user)
            .bind(validator)
            .bind(now())
            .execute(&mut *tx)
            .await?;
            SubscribeOutcome::Created
        };

        tx.commit().await?;
        tracing::debug!(?outcome, "subscribe");
        Ok(outcome)
    }

    async fn unsubscribe(&self, recipient: &RecipientId, validator: ValidatorId) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM subscription
              WHERE validator_id = $2
                AND subscriber_id = (SELECT id FROM subscriber WHERE chat_id = $1)",
        )
        .bind(recipient)
        .bind(validator)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn unsubscribe_all(&self, recipient: &RecipientId) -> Result<usize> {
        let res = sqlx::query(
            "DELETE FROM subscription
              WHERE subscriber_id = (SELECT id FROM subscriber WHERE chat_id = $1)",
        )
        .bind(recipient)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() as usize)
    }

    async fn subscriptions_of(&self, recipient: &RecipientId) -> Result<Vec<ValidatorRecord>> {
        let sql = format!(
            "SELECT {VALIDATOR_COLUMNS}
               FROM subscription AS sub
               JOIN subscriber AS s ON s.id = sub.subscriber_id
               JOIN validator AS v ON v.id = sub.validator_id
              WHERE s.chat_id = $1
              ORDER BY sub.id"
        );
        sqlx::query_as::<_, ValidatorRow>(&sql)
            .bind(recipient)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(validator_from_row)
            .collect()
    }

    async fn validator_by_address(&self, query: &AddressQuery) -> Result<Option<ValidatorRecord>> {
        let (column, value) = match query {
            AddressQuery::Validator(addr) => ("validator_address", addr.as_str()),
            AddressQuery::Node(addr) => ("node_address", addr.as_str()),
        };
        let sql = format!("SELECT {VALIDATOR_COLUMNS} FROM validator AS v WHERE v.{column} = $1");
        sqlx::query_as::<_, ValidatorRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .map(validator_from_row)
            .transpose()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        input::rpc::testing::MockValidator,
        notify::{DeliveryPolicy, NotificationDispatcher, testing::MockSender},
        tracker::{ChangeTracker, TrackOutcome},
        types::validator::{ValidatorSnapshot, ValidatorState},
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> PersistenceOptions {
        PersistenceOptions {
            path: dir.path().join("test.db"),
            max_connections: 5,
            subscription_limit: 2,
        }
    }

    fn snapshot(i: u8) -> ValidatorSnapshot {
        let v = MockValidator::new(i);
        ValidatorSnapshot {
            node_address: v.node_address.clone(),
            validator_address: v.validator_address(),
            voting_power: v.voting_power,
            metadata: v.metadata,
            commission: v.commission,
            state: v.state,
        }
    }

    fn insert(snapshot: &ValidatorSnapshot) -> ValidatorUpdate {
        ValidatorUpdate {
            existing: None,
            snapshot: snapshot.clone(),
            changes: vec![],
            detected_at: 100,
        }
    }

    #[test]
    fn test_options() {
        let opt = PersistenceOptions::parse_from(["--", "--db-path", "/tmp/watch.db"]);
        assert_eq!(opt.path, PathBuf::from("/tmp/watch.db"));
        assert_eq!(opt.max_connections, 10);
        assert_eq!(opt.subscription_limit, 4);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_store_and_load_validator() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = Persistence::open(&options(&temp_dir)).await.unwrap();

        let mut s = snapshot(0);
        s.metadata.description = None;
        s.commission.rate = 0.1 + 0.2;
        assert_eq!(persistence.validator(&s.node_address).await.unwrap(), None);

        let (id, changes) = persistence.store_update(insert(&s)).await.unwrap();
        assert!(changes.is_empty());
        assert_eq!(
            persistence.validator(&s.node_address).await.unwrap(),
            Some(ValidatorRecord::from_snapshot(id, &s))
        );
        assert_eq!(
            persistence
                .validator_by_address(&AddressQuery::Validator(s.validator_address.clone()))
                .await
                .unwrap(),
            Some(ValidatorRecord::from_snapshot(id, &s))
        );
        assert_eq!(persistence.validator_count().await.unwrap(), 1);

        // Overwrite with changes.
        let mut jailed = s.clone();
        jailed.state = ValidatorState::Jailed;
        jailed.voting_power = 0;
        let (same_id, changes) = persistence
            .store_update(ValidatorUpdate {
                existing: Some(id),
                snapshot: jailed.clone(),
                changes: vec![DetectedChange::state(s.state, jailed.state)],
                detected_at: 200,
            })
            .await
            .unwrap();
        assert_eq!(same_id, id);
        assert_eq!(changes.len(), 1);
        assert_eq!(
            persistence.validator(&s.node_address).await.unwrap(),
            Some(ValidatorRecord::from_snapshot(id, &jailed))
        );
        assert_eq!(persistence.unsent_count().await.unwrap(), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_store_update_atomic() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = Persistence::open(&options(&temp_dir)).await.unwrap();
        let s = snapshot(0);

        // Claiming an id the row does not have rolls back the row and its change records.
        persistence
            .store_update(ValidatorUpdate {
                existing: Some(999),
                snapshot: s.clone(),
                changes: vec![DetectedChange::commission(0.05, 0.1)],
                detected_at: 100,
            })
            .await
            .unwrap_err();
        assert_eq!(persistence.validator(&s.node_address).await.unwrap(), None);
        assert_eq!(persistence.unsent_count().await.unwrap(), 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_unsent_changes() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = Persistence::open(&options(&temp_dir)).await.unwrap();
        let a = snapshot(0);
        let b = snapshot(1);
        let (a_id, _) = persistence.store_update(insert(&a)).await.unwrap();
        let (b_id, _) = persistence.store_update(insert(&b)).await.unwrap();

        let (_, late) = persistence
            .store_update(ValidatorUpdate {
                existing: Some(a_id),
                snapshot: a.clone(),
                changes: vec![
                    DetectedChange::state(ValidatorState::Consensus, ValidatorState::Inactive),
                    DetectedChange::commission(0.05, 0.075),
                ],
                detected_at: 300,
            })
            .await
            .unwrap();
        let (_, early) = persistence
            .store_update(ValidatorUpdate {
                existing: Some(b_id),
                snapshot: b.clone(),
                changes: vec![DetectedChange::commission(0.05, 0.0)],
                detected_at: 200,
            })
            .await
            .unwrap();

        let pending = persistence.unsent_changes().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|c| c.record.id).collect();
        assert_eq!(ids, vec![early[0], late[0], late[1]]);
        assert_eq!(pending[0].node_address, b.node_address);
        assert_eq!(pending[0].validator_address, b.validator_address);
        assert_eq!(
            pending[0].record.change,
            DetectedChange::commission(0.05, 0.0)
        );
        assert_eq!(pending[2].record.detected_at, 300);
        assert!(!pending[2].record.sent);

        persistence.mark_sent(late[0]).await.unwrap();
        let ids: Vec<_> = persistence
            .unsent_changes()
            .await
            .unwrap()
            .iter()
            .map(|c| c.record.id)
            .collect();
        assert_eq!(ids, vec![early[0], late[1]]);

        persistence.mark_sent(12345).await.unwrap_err();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_subscriptions() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = Persistence::open(&options(&temp_dir)).await.unwrap();
        let mut ids = vec![];
        for i in 0..3 {
            let (id, _) = persistence.store_update(insert(&snapshot(i))).await.unwrap();
            ids.push(id);
        }
        let alice = "1001".to_string();
        let bob = "1002".to_string();

        persistence.ensure_user(&alice, Some("alice")).await.unwrap();
        assert_eq!(
            persistence.subscribe(&alice, ids[1]).await.unwrap(),
            SubscribeOutcome::Created
        );
        assert_eq!(
            persistence.subscribe(&alice, ids[1]).await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(
            persistence.subscribe(&alice, ids[0]).await.unwrap(),
            SubscribeOutcome::Created
        );
        assert_eq!(
            persistence.subscribe(&alice, ids[2]).await.unwrap(),
            SubscribeOutcome::LimitReached
        );
        // Bob is registered on first subscription.
        assert_eq!(
            persistence.subscribe(&bob, ids[1]).await.unwrap(),
            SubscribeOutcome::Created
        );
        // Unknown validators are rejected.
        persistence.subscribe(&bob, 999).await.unwrap_err();

        let watched: Vec<_> = persistence
            .subscriptions_of(&alice)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(watched, vec![ids[1], ids[0]]);
        assert_eq!(
            persistence.subscribers(ids[1]).await.unwrap(),
            vec![alice.clone(), bob.clone()]
        );
        assert_eq!(persistence.subscriber_count(ids[1]).await.unwrap(), 2);
        assert_eq!(persistence.subscriber_count(ids[2]).await.unwrap(), 0);

        assert!(persistence.unsubscribe(&alice, ids[1]).await.unwrap());
        assert!(!persistence.unsubscribe(&alice, ids[1]).await.unwrap());
        assert_eq!(
            persistence.subscribers(ids[1]).await.unwrap(),
            vec![bob.clone()]
        );

        assert_eq!(persistence.unsubscribe_all(&alice).await.unwrap(), 1);
        assert!(persistence.subscriptions_of(&alice).await.unwrap().is_empty());
        assert_eq!(persistence.unsubscribe_all(&"nobody".to_string()).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let s = snapshot(0);
        let id = {
            let persistence = Persistence::open(&options(&temp_dir)).await.unwrap();
            persistence.store_update(insert(&s)).await.unwrap().0
        };

        let persistence = Persistence::open(&options(&temp_dir)).await.unwrap();
        assert_eq!(
            persistence.validator(&s.node_address).await.unwrap(),
            Some(ValidatorRecord::from_snapshot(id, &s))
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_track_and_dispatch() {
        let temp_dir = TempDir::new().unwrap();
        let persistence = Persistence::open(&options(&temp_dir)).await.unwrap();
        let tracker = ChangeTracker::new(persistence.clone());
        let sender = MockSender::default();
        let dispatcher = NotificationDispatcher::new(
            persistence.clone(),
            sender.clone(),
            DeliveryPolicy {
                attempts: 1,
                retry_delay: Duration::ZERO,
            },
        );

        let s = snapshot(0);
        let TrackOutcome::Inserted(id) = tracker.track_validator(&s, 100).await.unwrap() else {
            panic!("expected insert");
        };
        persistence.subscribe(&"1001".to_string(), id).await.unwrap();

        let mut changed = s.clone();
        changed.commission.rate = 0.1;
        let summary = tracker.track(&[changed]).await;
        assert_eq!(summary.changes.len(), 1);

        let summary = dispatcher.run_cycle().await.unwrap();
        assert_eq!(summary.sent, 1);
        let delivered = sender.delivered().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "1001");
        assert!(delivered[0].1.contains("5% ➔ 10%"));
        assert_eq!(persistence.unsent_count().await.unwrap(), 0);
    }
}
