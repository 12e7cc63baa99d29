//! Validator attributes decoded from the remote node.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::common::{NodeAddress, ValidatorAddress, ValidatorId, VotingPower};
use crate::{Error, Result};

/// Self-reported descriptive information about a validator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ValidatorMetadata {
    pub email: String,
    pub description: Option<String>,
    pub website: Option<String>,
    pub discord_handle: Option<String>,
    pub avatar: Option<String>,
}

/// Commission charged by a validator, as fractions between 0 and 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CommissionInfo {
    /// The current commission rate.
    pub rate: f64,

    /// The largest change to `rate` the validator may make in a single epoch.
    pub max_change_per_epoch: f64,
}

/// The operational state of a validator.
///
/// The declaration order is the on-chain discriminant order and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ValidatorState {
    Consensus,
    BelowCapacity,
    BelowThreshold,
    Inactive,
    Jailed,
}

impl ValidatorState {
    /// All states, indexed by on-chain discriminant.
    pub const ALL: [Self; 5] = [
        Self::Consensus,
        Self::BelowCapacity,
        Self::BelowThreshold,
        Self::Inactive,
        Self::Jailed,
    ];

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consensus => "Consensus",
            Self::BelowCapacity => "BelowCapacity",
            Self::BelowThreshold => "BelowThreshold",
            Self::Inactive => "Inactive",
            Self::Jailed => "Jailed",
        }
    }
}

impl fmt::Display for ValidatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidatorState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::internal().context(format!("unknown validator state {s:?}")))
    }
}

/// Everything observed about one validator in one poll cycle.
///
/// Snapshots live only for the duration of a cycle; they are compared against and then written
/// over the persisted [`ValidatorRecord`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ValidatorSnapshot {
    pub node_address: NodeAddress,
    pub validator_address: ValidatorAddress,
    pub voting_power: VotingPower,
    pub metadata: ValidatorMetadata,
    pub commission: CommissionInfo,
    pub state: ValidatorState,
}

/// The persisted row for a tracked validator.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ValidatorRecord {
    pub id: ValidatorId,
    pub node_address: NodeAddress,
    pub validator_address: ValidatorAddress,
    pub voting_power: VotingPower,
    pub metadata: ValidatorMetadata,
    pub commission: CommissionInfo,
    pub state: ValidatorState,
}

impl ValidatorRecord {
    /// The persisted form of `snapshot` under row `id`.
    pub fn from_snapshot(id: ValidatorId, snapshot: &ValidatorSnapshot) -> Self {
        Self {
            id,
            node_address: snapshot.node_address.clone(),
            validator_address: snapshot.validator_address.clone(),
            voting_power: snapshot.voting_power,
            metadata: snapshot.metadata.clone(),
            commission: snapshot.commission,
            state: snapshot.state,
        }
    }
}
