#![cfg(any(test, feature = "testing"))]

use std::{collections::HashMap, sync::Arc};

use async_lock::Mutex;

use super::MessageSender;
use crate::{Error, Result, types::common::RecipientId};

#[derive(Debug, Default)]
struct Outbox {
    attempts: Vec<(RecipientId, String)>,
    delivered: Vec<(RecipientId, String)>,
    /// Remaining failures per recipient; [`None`] fails forever.
    failures: HashMap<RecipientId, Option<usize>>,
}

/// A message sender which records deliveries and fails on demand.
#[derive(Clone, Debug, Default)]
pub struct MockSender {
    outbox: Arc<Mutex<Outbox>>,
}

impl MockSender {
    /// Fail the next `n` attempts to reach `recipient`.
    pub async fn fail_times(&self, recipient: &str, n: usize) {
        self.outbox
            .lock()
            .await
            .failures
            .insert(recipient.to_string(), Some(n));
    }

    /// Fail every attempt to reach `recipient` until [`heal`](Self::heal) is called.
    pub async fn fail_always(&self, recipient: &str) {
        self.outbox
            .lock()
            .await
            .failures
            .insert(recipient.to_string(), None);
    }

    pub async fn heal(&self, recipient: &str) {
        self.outbox.lock().await.failures.remove(recipient);
    }

    /// Number of delivery attempts, successful or not.
    pub async fn attempts(&self) -> usize {
        self.outbox.lock().await.attempts.len()
    }

    /// Text of every delivery attempt, in order.
    pub async fn attempted_texts(&self) -> Vec<String> {
        self.outbox
            .lock()
            .await
            .attempts
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Successful deliveries, in order.
    pub async fn delivered(&self) -> Vec<(RecipientId, String)> {
        self.outbox.lock().await.delivered.clone()
    }
}

impl MessageSender for MockSender {
    async fn send(&self, recipient: &RecipientId, text: &str) -> Result<()> {
        let mut outbox = self.outbox.lock().await;
        outbox.attempts.push((recipient.clone(), text.to_string()));
        match outbox.failures.get_mut(recipient) {
            Some(None) => {
                return Err(Error::delivery_failure().context(format!("mock error: {recipient}")));
            }
            Some(Some(n)) if *n > 0 => {
                *n -= 1;
                return Err(Error::delivery_failure().context(format!("mock error: {recipient}")));
            }
            _ => {}
        }
        outbox.delivered.push((recipient.clone(), text.to_string()));
        Ok(())
    }
}
