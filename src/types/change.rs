//! Change records and the values they carry.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::{
    common::{ChangeId, NodeAddress, Timestamp, ValidatorAddress, ValidatorId},
    validator::ValidatorState,
};
use crate::{Error, Result};

/// The tracked attribute a change record refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AttributeKind {
    State,
    Commission,
}

impl AttributeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Commission => "commission",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "state" => Ok(Self::State),
            "commission" => Ok(Self::Commission),
            _ => Err(Error::internal().context(format!("unknown attribute kind {s:?}"))),
        }
    }
}

/// The value of a tracked attribute at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub enum AttributeValue {
    State(ValidatorState),

    /// A commission rate, as a fraction between 0 and 1.
    Commission(f64),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::State(_) => AttributeKind::State,
            Self::Commission(_) => AttributeKind::Commission,
        }
    }

    /// The lossless text form used in storage.
    ///
    /// Rates use the shortest representation which parses back to the identical `f64`.
    pub fn to_storage(&self) -> String {
        match self {
            Self::State(state) => state.as_str().to_string(),
            Self::Commission(rate) => rate.to_string(),
        }
    }

    /// Parse the text form produced by [`to_storage`](Self::to_storage).
    pub fn from_storage(kind: AttributeKind, s: &str) -> Result<Self> {
        match kind {
            AttributeKind::State => Ok(Self::State(s.parse()?)),
            AttributeKind::Commission => s.parse().map(Self::Commission).map_err(|err| {
                Error::internal().context(format!("invalid stored commission rate {s:?}: {err}"))
            }),
        }
    }
}

/// Rates are shown to users as percentages.
impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::State(state) => write!(f, "{state}"),
            Self::Commission(rate) => write!(f, "{}%", format_percent(*rate)),
        }
    }
}

fn format_percent(rate: f64) -> String {
    let percent = format!("{:.4}", rate * 100.0);
    percent
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// A transition detected between the persisted and the freshly observed value of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct DetectedChange {
    pub previous: AttributeValue,
    pub new: AttributeValue,
}

impl DetectedChange {
    pub fn state(previous: ValidatorState, new: ValidatorState) -> Self {
        Self {
            previous: AttributeValue::State(previous),
            new: AttributeValue::State(new),
        }
    }

    pub fn commission(previous: f64, new: f64) -> Self {
        Self {
            previous: AttributeValue::Commission(previous),
            new: AttributeValue::Commission(new),
        }
    }

    pub fn kind(&self) -> AttributeKind {
        self.new.kind()
    }
}

/// A persisted change record.
///
/// Records are created by the change tracker, and only ever mutated afterwards by the
/// notification dispatcher flipping `sent`. They are never deleted.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub validator_id: ValidatorId,
    pub change: DetectedChange,
    pub detected_at: Timestamp,
    pub sent: bool,
}

impl ChangeRecord {
    pub fn kind(&self) -> AttributeKind {
        self.change.kind()
    }
}

/// An unsent change record, joined with the addresses of the validator it concerns.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PendingChange {
    pub record: ChangeRecord,
    pub validator_address: ValidatorAddress,
    pub node_address: NodeAddress,
}
