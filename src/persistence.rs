//! Persistent storage for validators, change records and subscriptions.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{
    Result,
    types::{
        common::{AddressQuery, RecipientId, ValidatorId},
        validator::ValidatorRecord,
    },
};

pub mod memory;
pub mod sql;

/// The result of a subscription request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum SubscribeOutcome {
    Created,
    AlreadySubscribed,
    /// The user already watches as many validators as allowed.
    LimitReached,
}

/// Users and the validators they watch.
///
/// Users are identified by the delivery channel's recipient id.
pub trait SubscriptionStore: Clone + Send + Sync {
    /// Register a user, or refresh their display name if already registered.
    fn ensure_user(
        &self,
        recipient: &RecipientId,
        name: Option<&str>,
    ) -> impl Send + Future<Output = Result<()>>;

    /// Subscribe a user to a validator, registering the user if necessary.
    ///
    /// Subscribing twice to the same validator is not an error, and does not count twice against
    /// the user's subscription limit.
    fn subscribe(
        &self,
        recipient: &RecipientId,
        validator: ValidatorId,
    ) -> impl Send + Future<Output = Result<SubscribeOutcome>>;

    /// Remove a subscription. Returns whether it existed.
    fn unsubscribe(
        &self,
        recipient: &RecipientId,
        validator: ValidatorId,
    ) -> impl Send + Future<Output = Result<bool>>;

    /// Remove all of a user's subscriptions. Returns how many there were.
    fn unsubscribe_all(&self, recipient: &RecipientId) -> impl Send + Future<Output = Result<usize>>;

    /// The validators a user watches, oldest subscription first.
    fn subscriptions_of(
        &self,
        recipient: &RecipientId,
    ) -> impl Send + Future<Output = Result<Vec<ValidatorRecord>>>;

    /// Look a tracked validator up by either of its addresses.
    fn validator_by_address(
        &self,
        query: &AddressQuery,
    ) -> impl Send + Future<Output = Result<Option<ValidatorRecord>>>;
}
