//! The remote state-query node.
//!
//! Responses are deserialized into one typed result per endpoint and validated here, before any
//! field reaches the snapshot fetcher.

use std::future::Future;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};

use crate::{
    Error, Result,
    error::{ResultExt, ensure},
    types::common::{NodeAddress, ValidatorAddress, VotingPower},
};

pub mod client;
pub mod testing;

/// One entry of the consensus-layer validator set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorSetEntry {
    pub node_address: NodeAddress,
    pub voting_power: VotingPower,
}

/// One page of the validator set, along with the size of the whole set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatorSetPage {
    pub entries: Vec<ValidatorSetEntry>,
    pub total: usize,
}

/// Interface for querying validator state from a chain node.
pub trait NodeClient: Clone + Send + Sync {
    /// The latest block height.
    ///
    /// Fails with [`NodeCatchingUp`](crate::error::ErrorKind::NodeCatchingUp) if the node is still
    /// syncing, since its view of the chain is then not authoritative.
    fn get_height(&self) -> impl Send + Future<Output = Result<u64>>;

    /// A page of the validator set at `height`. Pages are numbered from 1.
    fn get_validator_set(
        &self,
        height: u64,
        page: usize,
        per_page: usize,
    ) -> impl Send + Future<Output = Result<ValidatorSetPage>>;

    /// The raw bytes stored at a state query path.
    fn query_by_path(&self, path: &str) -> impl Send + Future<Output = Result<Vec<u8>>>;
}

/// State query paths.
pub mod paths {
    use super::*;

    pub fn validator_by_node(node: &NodeAddress) -> String {
        format!("/vp/pos/validator_by_tm_addr/{node}")
    }

    pub fn metadata(validator: &ValidatorAddress) -> String {
        format!("/vp/pos/validator/metadata/{validator}")
    }

    pub fn commission(validator: &ValidatorAddress) -> String {
        format!("/vp/pos/validator/commission/{validator}")
    }

    pub fn state(validator: &ValidatorAddress) -> String {
        format!("/vp/pos/validator/state/{validator}")
    }
}

/// The JSON-RPC envelope around every response.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl<T> RpcResponse<T> {
    pub fn into_result(self) -> Result<T> {
        if let Some(err) = self.error {
            return Err(Error::protocol().context(format!(
                "node returned error {}: {} {}",
                err.code,
                err.message,
                err.data.map(|data| data.to_string()).unwrap_or_default()
            )));
        }
        self.result
            .ok_or_else(|| Error::protocol().context("response has neither result nor error"))
    }
}

/// Parse a JSON-RPC response body.
pub fn parse_response<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice::<RpcResponse<T>>(body)
        .context(Error::protocol)?
        .into_result()
}

/// Result of `GET status`.
#[derive(Clone, Debug, Deserialize)]
pub struct StatusResult {
    pub sync_info: SyncInfo,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SyncInfo {
    #[serde(deserialize_with = "string_or_number")]
    pub latest_block_height: u64,
    #[serde(default)]
    pub catching_up: bool,
}

impl StatusResult {
    /// The latest height, provided the node is synced.
    pub fn height(&self) -> Result<u64> {
        ensure!(
            !self.sync_info.catching_up,
            Error::catching_up().context(format!(
                "node reports height {} while syncing",
                self.sync_info.latest_block_height
            ))
        );
        Ok(self.sync_info.latest_block_height)
    }
}

/// Result of `GET validators`.
#[derive(Clone, Debug, Deserialize)]
pub struct ValidatorsResult {
    pub validators: Vec<ValidatorsEntry>,
    #[serde(deserialize_with = "string_or_number")]
    pub total: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ValidatorsEntry {
    pub address: String,
    #[serde(deserialize_with = "string_or_number")]
    pub voting_power: u64,
}

impl TryFrom<ValidatorsResult> for ValidatorSetPage {
    type Error = Error;

    fn try_from(res: ValidatorsResult) -> Result<Self> {
        let entries = res
            .validators
            .into_iter()
            .map(|v| {
                let node_address = v.address.parse().map_err(|err: Error| {
                    Error::protocol().context(format!("validator set entry: {err}"))
                })?;
                Ok(ValidatorSetEntry {
                    node_address,
                    voting_power: v.voting_power,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            entries,
            total: res.total as usize,
        })
    }
}

/// Result of the `abci_query` method.
#[derive(Clone, Debug, Deserialize)]
pub struct AbciQueryResult {
    pub response: AbciResponse,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AbciResponse {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub log: String,
}

impl AbciResponse {
    /// The decoded value bytes.
    ///
    /// A non-zero code or an empty value means nothing is stored at the path; the node explains
    /// why in `info` or `log`.
    pub fn into_value(self) -> Result<Vec<u8>> {
        ensure!(
            self.code == 0,
            Error::protocol().context(format!(
                "query failed with code {}: {} {}",
                self.code, self.info, self.log
            ))
        );
        let value = self.value.unwrap_or_default();
        ensure!(
            !value.is_empty(),
            Error::protocol().context(format!("query returned no value: {}", self.info))
        );
        BASE64.decode(value).context(Error::invalid_encoding)
    }
}

/// CometBFT renders 64-bit integers as JSON strings.
fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        String(String),
    }

    match Repr::deserialize(d)? {
        Repr::Number(n) => Ok(n),
        Repr::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
