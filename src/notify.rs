//! Delivery of change records to subscribers.

use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::instrument;

use crate::{
    Error, Result,
    types::{
        change::{AttributeKind, PendingChange},
        common::{ChangeId, RecipientId, ValidatorId, format_timestamp},
    },
};

pub mod telegram;
pub mod testing;

/// A channel which can deliver a text message to a recipient.
pub trait MessageSender: Clone + Send + Sync {
    /// Make a single delivery attempt.
    fn send(&self, recipient: &RecipientId, text: &str) -> impl Send + Future<Output = Result<()>>;
}

/// Persistent storage for the notification side of change records.
pub trait NotificationPersistence: Clone + Send + Sync {
    /// All change records not yet marked sent, oldest detection first, ties broken by id.
    fn unsent_changes(&self) -> impl Send + Future<Output = Result<Vec<PendingChange>>>;

    /// Recipients subscribed to a validator, in subscription order.
    fn subscribers(
        &self,
        validator: ValidatorId,
    ) -> impl Send + Future<Output = Result<Vec<RecipientId>>>;

    /// Flag a change record as delivered.
    fn mark_sent(&self, change: ChangeId) -> impl Send + Future<Output = Result<()>>;
}

/// How hard to try delivering one message to one recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Total attempts before giving up. At least one attempt is always made.
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub retry_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Deliver a message, retrying a bounded number of times.
pub async fn send_with_retry<M: MessageSender>(
    sender: &M,
    policy: DeliveryPolicy,
    recipient: &RecipientId,
    text: &str,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match sender.send(recipient, text).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= attempts => {
                return Err(Error::delivery_failure().context(format!(
                    "giving up on {recipient} after {attempts} attempts: {err}"
                )));
            }
            Err(err) => {
                tracing::warn!(
                    %recipient,
                    attempt,
                    "delivery failed, retrying in {:?}: {err}",
                    policy.retry_delay
                );
                sleep(policy.retry_delay).await;
                attempt += 1;
            }
        }
    }
}

/// Render the alert for a change record.
pub fn format_message(change: &PendingChange) -> String {
    let record = &change.record;
    let (title, label, closing) = match record.kind() {
        AttributeKind::State => (
            "Validator State Change Alert",
            "State Change",
            "Stay tuned for more updates.",
        ),
        AttributeKind::Commission => (
            "Validator Commission Change Alert",
            "Commission Rate",
            "Keep an eye on your validators' performance.",
        ),
    };
    format!(
        "🔔 <b>{title}</b>\n\n\
         🆔 Change ID: {id}\n\
         🔹 Address: <code>{validator}</code>\n\
         🔹 TM Address: <code>{node}</code>\n\
         🔹 {label}: <b>⚠️{previous} ➔ {new}⚠️</b>\n\
         🔹 Detected At: 🕒{detected_at}\n\n\
         Please ignore this message if you have received it before.\n\
         {closing}",
        id = record.id,
        validator = change.validator_address,
        node = change.node_address,
        previous = record.change.previous,
        new = record.change.new,
        detected_at = format_timestamp(record.detected_at),
    )
}

/// What happened to one change record during a notify cycle.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every subscriber received the alert and the record is now sent.
    Delivered { recipients: usize },

    /// Nobody watches the validator any more; the record was marked sent without delivery.
    NoSubscribers,

    /// Delivery stopped at a failing recipient. The record stays unsent and will be delivered
    /// again, in full, on the next cycle.
    Failed { delivered: usize, error: Error },
}

/// Totals for one notify cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Records marked sent, with or without subscribers.
    pub sent: usize,
    /// Records left unsent for the next cycle.
    pub unsent: usize,
    /// Individual messages delivered.
    pub deliveries: usize,
    /// Individual messages which failed after all retries.
    pub delivery_failures: usize,
}

#[derive(Clone, Debug)]
pub struct NotificationDispatcher<S, M> {
    storage: S,
    sender: M,
    policy: DeliveryPolicy,
}

impl<S: NotificationPersistence, M: MessageSender> NotificationDispatcher<S, M> {
    pub fn new(storage: S, sender: M, policy: DeliveryPolicy) -> Self {
        Self {
            storage,
            sender,
            policy,
        }
    }

    /// Deliver one change record to all its subscribers, in order, stopping at the first failure.
    #[instrument(skip(self, change), fields(change_id = change.record.id))]
    pub async fn dispatch(&self, change: &PendingChange) -> Result<DispatchOutcome> {
        let subscribers = self.storage.subscribers(change.record.validator_id).await?;
        if subscribers.is_empty() {
            tracing::info!("no subscribers, nothing to deliver");
            self.storage.mark_sent(change.record.id).await?;
            return Ok(DispatchOutcome::NoSubscribers);
        }

        let text = format_message(change);
        for (delivered, recipient) in subscribers.iter().enumerate() {
            if let Err(error) = send_with_retry(&self.sender, self.policy, recipient, &text).await {
                tracing::warn!(delivered, "stopping delivery: {error}");
                return Ok(DispatchOutcome::Failed { delivered, error });
            }
        }
        self.storage.mark_sent(change.record.id).await?;
        Ok(DispatchOutcome::Delivered {
            recipients: subscribers.len(),
        })
    }

    /// Drain all unsent change records.
    ///
    /// Fails only if the unsent records cannot be read. Any other failure leaves the affected
    /// record unsent for the next cycle.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<DispatchSummary> {
        let changes = self.storage.unsent_changes().await?;
        let mut summary = DispatchSummary::default();
        for change in &changes {
            match self.dispatch(change).await {
                Ok(DispatchOutcome::Delivered { recipients }) => {
                    summary.sent += 1;
                    summary.deliveries += recipients;
                }
                Ok(DispatchOutcome::NoSubscribers) => summary.sent += 1,
                Ok(DispatchOutcome::Failed { delivered, .. }) => {
                    summary.unsent += 1;
                    summary.deliveries += delivered;
                    summary.delivery_failures += 1;
                }
                Err(err) => {
                    tracing::error!(change_id = change.record.id, "failed to dispatch change: {err}");
                    summary.unsent += 1;
                }
            }
        }
        tracing::info!(
            sent = summary.sent,
            unsent = summary.unsent,
            deliveries = summary.deliveries,
            "notify cycle complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::{testing::MockSender, *};
    use crate::{
        input::rpc::testing::MockValidator,
        persistence::{SubscriptionStore, memory::MemoryStorage},
        tracker::{ChangeTracker, TrackOutcome},
        types::{
            change::{ChangeRecord, DetectedChange},
            validator::{ValidatorSnapshot, ValidatorState},
        },
    };

    fn policy() -> DeliveryPolicy {
        DeliveryPolicy {
            attempts: 3,
            retry_delay: Duration::ZERO,
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

    /// Track validator `i`, subscribe `recipients` to it, and record a state change at `at`.
    async fn setup_change(
        storage: &MemoryStorage,
        i: u8,
        recipients: &[&str],
        at: i64,
    ) -> ChangeId {
        let tracker = ChangeTracker::new(storage.clone());
        let s = snapshot(i);
        let TrackOutcome::Inserted(id) = tracker.track_validator(&s, at - 1).await.unwrap() else {
            panic!("validator {i} already tracked");
        };
        for r in recipients {
            storage.subscribe(&r.to_string(), id).await.unwrap();
        }
        let mut jailed = s;
        jailed.state = ValidatorState::Jailed;
        let TrackOutcome::Updated { changes, .. } =
            tracker.track_validator(&jailed, at).await.unwrap()
        else {
            panic!("validator {i} not updated");
        };
        changes[0]
    }

    #[test]
    fn test_format_message() {
        let v = MockValidator::new(1);
        let mut change = PendingChange {
            record: ChangeRecord {
                id: 42,
                validator_id: 1,
                change: DetectedChange::state(ValidatorState::Consensus, ValidatorState::Jailed),
                detected_at: 1_700_000_000,
                sent: false,
            },
            validator_address: v.validator_address(),
            node_address: v.node_address.clone(),
        };
        let text = format_message(&change);
        assert!(text.starts_with("🔔 <b>Validator State Change Alert</b>\n\n"));
        assert!(text.contains("🆔 Change ID: 42\n"));
        assert!(text.contains(&format!("Address: <code>{}</code>", v.validator_address())));
        assert!(text.contains(&format!("TM Address: <code>{}</code>", v.node_address)));
        assert!(text.contains("<b>⚠️Consensus ➔ Jailed⚠️</b>"));
        assert!(text.contains("Detected At: 🕒2023-11-14 22:13:20"));
        assert!(text.contains("Please ignore this message if you have received it before."));

        change.record.change = DetectedChange::commission(0.05, 0.1);
        let text = format_message(&change);
        assert!(text.contains("Validator Commission Change Alert"));
        assert!(text.contains("Commission Rate: <b>⚠️5% ➔ 10%⚠️</b>"));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_retry_then_deliver() {
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let change = setup_change(&storage, 0, &["alice"], 100).await;

        // Fails twice, succeeds on the last allowed attempt.
        sender.fail_times("alice", 2).await;
        let dispatcher = NotificationDispatcher::new(storage.clone(), sender.clone(), policy());
        let summary = dispatcher.run_cycle().await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.deliveries, 1);
        assert_eq!(sender.attempts().await, 3);
        assert!(storage.cmp_key().await.changes[&change].sent);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_failed_delivery_retried_next_cycle() {
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let change = setup_change(&storage, 0, &["alice"], 100).await;
        let dispatcher = NotificationDispatcher::new(storage.clone(), sender.clone(), policy());

        sender.fail_always("alice").await;
        let summary = dispatcher.run_cycle().await.unwrap();
        assert_eq!(summary.unsent, 1);
        assert_eq!(summary.delivery_failures, 1);
        assert_eq!(sender.attempts().await, 3);
        assert!(sender.delivered().await.is_empty());
        assert!(!storage.cmp_key().await.changes[&change].sent);

        let failed_text = sender.attempted_texts().await[0].clone();

        sender.heal("alice").await;
        let summary = dispatcher.run_cycle().await.unwrap();
        assert_eq!(summary.sent, 1);
        let delivered = sender.delivered().await;
        assert_eq!(delivered, vec![("alice".to_string(), failed_text)]);
        assert!(storage.cmp_key().await.changes[&change].sent);

        // Never delivered again.
        let summary = dispatcher.run_cycle().await.unwrap();
        assert_eq!(summary, DispatchSummary::default());
        assert_eq!(sender.delivered().await.len(), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_short_circuit() {
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let change = setup_change(&storage, 0, &["alice", "bob", "carol"], 100).await;
        let dispatcher = NotificationDispatcher::new(storage.clone(), sender.clone(), policy());

        sender.fail_always("bob").await;
        let summary = dispatcher.run_cycle().await.unwrap();
        assert_eq!(summary.unsent, 1);
        assert_eq!(summary.deliveries, 1);
        let recipients: Vec<_> = sender.delivered().await.into_iter().map(|(r, _)| r).collect();
        assert_eq!(recipients, vec!["alice"]);
        assert!(!storage.cmp_key().await.changes[&change].sent);

        // At-least-once: alice hears about it again on the retry.
        sender.heal("bob").await;
        dispatcher.run_cycle().await.unwrap();
        let recipients: Vec<_> = sender.delivered().await.into_iter().map(|(r, _)| r).collect();
        assert_eq!(recipients, vec!["alice", "alice", "bob", "carol"]);
        assert!(storage.cmp_key().await.changes[&change].sent);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_no_subscribers_marked_sent() {
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let change = setup_change(&storage, 0, &["alice"], 100).await;
        storage.unsubscribe_all(&"alice".to_string()).await.unwrap();

        let dispatcher = NotificationDispatcher::new(storage.clone(), sender.clone(), policy());
        let summary = dispatcher.run_cycle().await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.deliveries, 0);
        assert_eq!(sender.attempts().await, 0);
        assert!(storage.cmp_key().await.changes[&change].sent);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_delivery_order() {
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let late = setup_change(&storage, 0, &["alice"], 200).await;
        let early = setup_change(&storage, 1, &["alice"], 100).await;

        let dispatcher = NotificationDispatcher::new(storage.clone(), sender.clone(), policy());
        dispatcher.run_cycle().await.unwrap();
        let texts: Vec<_> = sender.delivered().await.into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains(&format!("Change ID: {early}\n")));
        assert!(texts[1].contains(&format!("Change ID: {late}\n")));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_storage_failure_leaves_unsent() {
        let storage = MemoryStorage::default();
        let sender = MockSender::default();
        let change = setup_change(&storage, 0, &["alice"], 100).await;
        let dispatcher = NotificationDispatcher::new(storage.clone(), sender.clone(), policy());

        storage.fail_next();
        dispatcher.run_cycle().await.unwrap_err();
        assert!(!storage.cmp_key().await.changes[&change].sent);

        dispatcher.run_cycle().await.unwrap();
        assert!(storage.cmp_key().await.changes[&change].sent);
    }
}
