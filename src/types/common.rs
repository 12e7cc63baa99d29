//! Primitive types.

use std::{fmt, str::FromStr};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    codec::address::{self, RawAddress},
    error::ensure,
};

/// A Unix timestamp in seconds since epoch.
pub type Timestamp = i64;

/// Voting power of a validator, as reported by the consensus layer.
pub type VotingPower = u64;

/// Row identifier of a tracked validator.
pub type ValidatorId = i64;

/// Row identifier of a change record.
pub type ChangeId = i64;

/// Identifier of a notification recipient, as understood by the message-delivery channel.
pub type RecipientId = String;

/// The current time as a [`Timestamp`].
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Render a [`Timestamp`] the way it appears in notification messages.
pub fn format_timestamp(ts: Timestamp) -> String {
    match chrono::DateTime::from_timestamp(ts, 0) {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

/// Length in bytes of a consensus-layer node address.
pub const NODE_ADDRESS_LEN: usize = 20;

/// The fixed-length hex identifier of a validator in the consensus-layer registry.
///
/// Always stored in upper case, which is how the consensus layer reports it.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|err| {
            Error::malformed_address().context(format!("node address {s:?} is not hex: {err}"))
        })?;
        ensure!(
            bytes.len() == NODE_ADDRESS_LEN,
            Error::malformed_address().context(format!(
                "node address {s:?} has {} bytes, expected {NODE_ADDRESS_LEN}",
                bytes.len()
            ))
        );
        Ok(Self(hex::encode_upper(bytes)))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(addr: NodeAddress) -> Self {
        addr.0
    }
}

/// The human-readable prefix of validator addresses on the tracked network.
pub const DEFAULT_ADDRESS_PREFIX: &str = "tnam";

/// The bech32m display form of a validator's account.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidatorAddress(String);

impl ValidatorAddress {
    /// Encode a raw address under the given human-readable prefix.
    pub fn encode(raw: &RawAddress, prefix: &str) -> Result<Self> {
        address::encode(raw.tag(), raw.hash(), prefix).map(Self)
    }

    /// The raw address bytes and human-readable prefix this address encodes.
    pub fn decode(&self) -> Result<(String, RawAddress)> {
        let (prefix, data) = address::decode(&self.0)?;
        Ok((prefix, RawAddress::try_from(data.as_slice())?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ValidatorAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (_, data) = address::decode(s)?;
        RawAddress::try_from(data.as_slice())?;
        Ok(Self(s.to_lowercase()))
    }
}

impl TryFrom<String> for ValidatorAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ValidatorAddress> for String {
    fn from(addr: ValidatorAddress) -> Self {
        addr.0
    }
}

/// User-supplied text identifying a validator by either of its addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressQuery {
    Validator(ValidatorAddress),
    Node(NodeAddress),
}

impl FromStr for AddressQuery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if s.len() == 2 * NODE_ADDRESS_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Self::Node(s.parse()?));
        }
        let addr: ValidatorAddress = s.parse().map_err(|err: Error| {
            err.context("expected a validator address or a 40-character node address")
        })?;
        Ok(Self::Validator(addr))
    }
}

impl fmt::Display for AddressQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Validator(addr) => write!(f, "{addr}"),
            Self::Node(addr) => write!(f, "{addr}"),
        }
    }
}
