//! Fixed-interval execution of the change and notify cycles.

use std::{future::Future, sync::Arc, time::Duration};

use async_lock::Mutex;
use tokio::{
    task::spawn,
    time::{MissedTickBehavior, interval},
};
use tracing::instrument;

use crate::{
    Result,
    input::{rpc::NodeClient, snapshot::SnapshotFetcher},
    metrics::PrometheusMetrics,
    notify::{
        DeliveryPolicy, DispatchSummary, MessageSender, NotificationDispatcher,
        NotificationPersistence,
    },
    tracker::{ChangeTracker, TrackSummary, ValidatorPersistence},
};

/// Prevents a cycle from starting while its previous run is still going.
#[derive(Clone, Debug)]
pub struct CycleGuard {
    name: &'static str,
    running: Arc<Mutex<()>>,
}

impl CycleGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Default::default(),
        }
    }

    /// Run `f` unless another run through this guard is in progress.
    ///
    /// Returns [`None`] without polling `f` if the run was skipped.
    pub async fn run<F: Future>(&self, f: F) -> Option<F::Output> {
        let Some(_running) = self.running.try_lock() else {
            tracing::warn!(cycle = self.name, "previous run still in progress, skipping");
            return None;
        };
        Some(f.await)
    }
}

/// The whole pipeline: snapshot, diff and persist on one cycle, deliver on another.
#[derive(Clone, Debug)]
pub struct Service<C, S, M> {
    fetcher: SnapshotFetcher<C>,
    tracker: ChangeTracker<S>,
    dispatcher: NotificationDispatcher<S, M>,
    metrics: PrometheusMetrics,
    change_guard: CycleGuard,
    notify_guard: CycleGuard,
}

impl<C, S, M> Service<C, S, M>
where
    C: NodeClient + 'static,
    S: ValidatorPersistence + NotificationPersistence + 'static,
    M: MessageSender + 'static,
{
    pub fn new(
        fetcher: SnapshotFetcher<C>,
        storage: S,
        sender: M,
        policy: DeliveryPolicy,
        metrics: PrometheusMetrics,
    ) -> Self {
        Self {
            fetcher,
            tracker: ChangeTracker::new(storage.clone()),
            dispatcher: NotificationDispatcher::new(storage, sender, policy),
            metrics,
            change_guard: CycleGuard::new("change"),
            notify_guard: CycleGuard::new("notify"),
        }
    }

    pub fn metrics(&self) -> &PrometheusMetrics {
        &self.metrics
    }

    /// Fetch a snapshot of every validator and record what changed.
    ///
    /// Returns [`None`] if the previous change cycle is still running.
    pub async fn change_cycle(&self) -> Result<Option<TrackSummary>> {
        self.change_guard
            .run(self.run_change_cycle())
            .await
            .transpose()
    }

    /// Deliver all unsent change records.
    ///
    /// Returns [`None`] if the previous notify cycle is still running.
    pub async fn notify_cycle(&self) -> Result<Option<DispatchSummary>> {
        self.notify_guard
            .run(self.run_notify_cycle())
            .await
            .transpose()
    }

    #[instrument(skip(self))]
    async fn run_change_cycle(&self) -> Result<TrackSummary> {
        let cycle = match self.fetcher.fetch_cycle().await {
            Ok(cycle) => cycle,
            Err(err) => {
                self.metrics.aborted_cycles.inc();
                return Err(err);
            }
        };
        self.metrics.latest_height.set(cycle.height as f64);
        self.metrics
            .tracked_validators
            .set(cycle.snapshots.len() as f64);
        self.metrics
            .skipped_validators
            .set(cycle.skipped.len() as f64);

        let summary = self.tracker.track(&cycle.snapshots).await;
        self.metrics
            .change_records_created
            .inc_by(summary.changes.len() as u64);
        Ok(summary)
    }

    #[instrument(skip(self))]
    async fn run_notify_cycle(&self) -> Result<DispatchSummary> {
        let summary = self.dispatcher.run_cycle().await?;
        self.metrics
            .notifications_delivered
            .inc_by(summary.deliveries as u64);
        self.metrics
            .notification_failures
            .inc_by(summary.delivery_failures as u64);
        self.metrics
            .pending_change_records
            .set(summary.unsent as f64);
        Ok(summary)
    }

    /// Run both cycles forever, each on its own fixed interval, starting immediately.
    ///
    /// Every tick starts a run in the background, so a slow run does not delay the schedule. A
    /// tick which arrives while the previous run of the same cycle is in progress is skipped.
    pub async fn run(self, update_interval: Duration, notify_interval: Duration) {
        tracing::info!(?update_interval, ?notify_interval, "starting validator watch");
        let change = {
            let service = self.clone();
            async move {
                let mut ticker = interval(update_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let service = service.clone();
                    spawn(async move {
                        if let Err(err) = service.change_cycle().await {
                            tracing::error!("change cycle failed: {err}");
                        }
                    });
                }
            }
        };
        let notify = async move {
            let mut ticker = interval(notify_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let service = self.clone();
                spawn(async move {
                    if let Err(err) = service.notify_cycle().await {
                        tracing::error!("notify cycle failed: {err}");
                    }
                });
            }
        };
        futures::join!(change, notify);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::ErrorKind,
        input::rpc::{client::RpcOptions, testing::MockNodeClient},
        notify::testing::MockSender,
        persistence::{SubscriptionStore, memory::MemoryStorage},
        types::{common::AddressQuery, validator::ValidatorState},
    };
    use tokio::time::sleep;

    type TestService = Service<MockNodeClient, MemoryStorage, MockSender>;

    fn service(node: &MockNodeClient, storage: &MemoryStorage, sender: &MockSender) -> TestService {
        let opt = RpcOptions::new("http://localhost:26657".parse().unwrap());
        Service::new(
            SnapshotFetcher::new(node.clone(), &opt),
            storage.clone(),
            sender.clone(),
            DeliveryPolicy {
                attempts: 2,
                retry_delay: Duration::ZERO,
            },
            PrometheusMetrics::default(),
        )
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_guard_skips_overlapping_run() {
        let guard = CycleGuard::new("test");
        let nested = guard.run(async { guard.run(async { 1 }).await }).await;
        assert_eq!(nested, Some(None));

        // Released once the first run completes.
        assert_eq!(guard.run(async { 2 }).await, Some(2));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_change_then_notify() {
        let node = MockNodeClient::new(3);
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let service = service(&node, &storage, &sender);

        let summary = service.change_cycle().await.unwrap().unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(storage.cmp_key().await.validators.len(), 3);

        let target = node.validators().await[1].node_address.clone();
        let record = storage
            .validator_by_address(&AddressQuery::Node(target.clone()))
            .await
            .unwrap()
            .unwrap();
        storage
            .subscribe(&"1001".to_string(), record.id)
            .await
            .unwrap();

        node.advance().await;
        node.set_state(&target, ValidatorState::Jailed).await;
        node.set_commission_rate(&target, 0.2).await;
        let summary = service.change_cycle().await.unwrap().unwrap();
        assert_eq!(summary.updated, 3);
        assert_eq!(summary.changes.len(), 2);

        let summary = service.notify_cycle().await.unwrap().unwrap();
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.deliveries, 2);
        let delivered = sender.delivered().await;
        assert!(delivered[0].1.contains("Consensus ➔ Jailed"));
        assert!(delivered[1].1.contains("5% ➔ 20%"));

        let metrics = service.metrics().export().unwrap();
        assert!(metrics.contains("latest_height 2"), "{metrics}");
        assert!(metrics.contains("tracked_validators 3"), "{metrics}");
        assert!(metrics.contains("change_records_created 2"), "{metrics}");
        assert!(metrics.contains("notifications_delivered 2"), "{metrics}");
        assert!(metrics.contains("pending_change_records 0"), "{metrics}");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_catching_up_aborts_cycle() {
        let node = MockNodeClient::new(2);
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let service = service(&node, &storage, &sender);
        service.change_cycle().await.unwrap();
        let before = storage.cmp_key().await;

        node.set_catching_up(true).await;
        node.set_voting_power(&node.validators().await[0].node_address, 1)
            .await;
        let err = service.change_cycle().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeCatchingUp);
        assert_eq!(storage.cmp_key().await, before);
        assert!(
            service
                .metrics()
                .export()
                .unwrap()
                .contains("aborted_cycles 1")
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_failed_delivery_counted() {
        let node = MockNodeClient::new(1);
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let service = service(&node, &storage, &sender);
        service.change_cycle().await.unwrap();

        let target = node.validators().await[0].node_address.clone();
        let id = storage
            .validator_by_address(&AddressQuery::Node(target.clone()))
            .await
            .unwrap()
            .unwrap()
            .id;
        storage.subscribe(&"1001".to_string(), id).await.unwrap();
        node.set_state(&target, ValidatorState::Inactive).await;
        service.change_cycle().await.unwrap();

        sender.fail_always("1001").await;
        let summary = service.notify_cycle().await.unwrap().unwrap();
        assert_eq!(summary.unsent, 1);
        let metrics = service.metrics().export().unwrap();
        assert!(metrics.contains("notification_failures 1"), "{metrics}");
        assert!(metrics.contains("pending_change_records 1"), "{metrics}");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_run_starts_immediately() {
        let node = MockNodeClient::new(2);
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let service = service(&node, &storage, &sender);

        let task = spawn(service.run(Duration::from_secs(3600), Duration::from_secs(3600)));
        let mut tracked = 0;
        for _ in 0..50 {
            sleep(Duration::from_millis(100)).await;
            tracked = storage.cmp_key().await.validators.len();
            if tracked == 2 {
                break;
            }
        }
        task.abort();
        assert_eq!(tracked, 2);
    }
}
