#![cfg(any(test, feature = "testing"))]

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_lock::RwLock;

use super::{NodeClient, ValidatorSetEntry, ValidatorSetPage, paths};
use crate::{
    Error, Result,
    codec::{address::RawAddress, binary::testing::*},
    error::ensure,
    types::{
        common::{DEFAULT_ADDRESS_PREFIX, NodeAddress, ValidatorAddress, VotingPower},
        validator::{CommissionInfo, ValidatorMetadata, ValidatorState},
    },
};

/// A validator known to a [`MockNodeClient`].
#[derive(Clone, Debug)]
pub struct MockValidator {
    pub node_address: NodeAddress,
    /// The account address in registry-lookup form, as returned by the reverse lookup.
    pub raw_address: RawAddress,
    pub voting_power: VotingPower,
    pub metadata: ValidatorMetadata,
    pub commission: CommissionInfo,
    pub state: ValidatorState,
}

impl MockValidator {
    /// A validator with deterministic addresses derived from `i`.
    pub fn new(i: u8) -> Self {
        let node_address = hex::encode([i; 20])
            .parse()
            .unwrap_or_else(|err| panic!("invalid mock node address: {err}"));
        Self {
            node_address,
            raw_address: RawAddress::new(0, [i.wrapping_add(0x80); 20]),
            voting_power: 1000 + u64::from(i),
            metadata: ValidatorMetadata {
                email: format!("validator{i}@example.com"),
                website: Some(format!("https://validator{i}.example.com")),
                ..Default::default()
            },
            commission: CommissionInfo {
                rate: 0.05,
                max_change_per_epoch: 0.01,
            },
            state: ValidatorState::Consensus,
        }
    }

    /// The display address the fetcher is expected to derive.
    pub fn validator_address(&self) -> ValidatorAddress {
        ValidatorAddress::encode(&self.raw_address.flip_tag(), DEFAULT_ADDRESS_PREFIX)
            .unwrap_or_else(|err| panic!("invalid mock validator address: {err}"))
    }
}

#[derive(Debug, Default)]
struct MockNode {
    height: u64,
    catching_up: bool,
    unavailable: bool,
    stall_pagination: bool,
    validators: Vec<MockValidator>,
    failing_paths: HashSet<String>,
}

/// A node client serving a configurable, in-memory validator set.
///
/// Clones share state, so a test can keep a handle and change the chain between cycles.
#[derive(Clone, Debug, Default)]
pub struct MockNodeClient {
    node: Arc<RwLock<MockNode>>,
    queries: Arc<AtomicUsize>,
}

impl MockNodeClient {
    /// A synced node at height 1 with validators `0..n`.
    pub fn new(n: u8) -> Self {
        let node = MockNode {
            height: 1,
            validators: (0..n).map(MockValidator::new).collect(),
            ..Default::default()
        };
        Self {
            node: Arc::new(RwLock::new(node)),
            queries: Default::default(),
        }
    }

    pub async fn validators(&self) -> Vec<MockValidator> {
        self.node.read().await.validators.clone()
    }

    pub async fn push_validator(&self, validator: MockValidator) {
        self.node.write().await.validators.push(validator);
    }

    /// Advance the chain by one block.
    pub async fn advance(&self) {
        self.node.write().await.height += 1;
    }

    pub async fn set_state(&self, node: &NodeAddress, state: ValidatorState) {
        self.update(node, |v| v.state = state).await;
    }

    pub async fn set_commission_rate(&self, node: &NodeAddress, rate: f64) {
        self.update(node, |v| v.commission.rate = rate).await;
    }

    pub async fn set_voting_power(&self, node: &NodeAddress, voting_power: VotingPower) {
        self.update(node, |v| v.voting_power = voting_power).await;
    }

    pub async fn set_catching_up(&self, catching_up: bool) {
        self.node.write().await.catching_up = catching_up;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.node.write().await.unavailable = unavailable;
    }

    /// Serve empty pages after the first, while still reporting the full total.
    pub async fn stall_pagination(&self) {
        self.node.write().await.stall_pagination = true;
    }

    /// Fail every query for the given path.
    pub async fn fail_path(&self, path: String) {
        self.node.write().await.failing_paths.insert(path);
    }

    /// Number of state queries served so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn update(&self, node: &NodeAddress, f: impl FnOnce(&mut MockValidator)) {
        let mut inner = self.node.write().await;
        let validator = inner
            .validators
            .iter_mut()
            .find(|v| &v.node_address == node)
            .unwrap_or_else(|| panic!("unknown mock validator {node}"));
        f(validator);
    }
}

impl MockNode {
    fn check_available(&self) -> Result<()> {
        ensure!(
            !self.unavailable,
            Error::unavailable().context("mock error: node is down")
        );
        Ok(())
    }

    fn respond(&self, path: &str) -> Result<Vec<u8>> {
        for v in &self.validators {
            if path == paths::validator_by_node(&v.node_address) {
                return Ok(address_response(&v.raw_address));
            }
            let address = v.validator_address();
            if path == paths::metadata(&address) {
                return Ok(metadata_response(&v.metadata));
            }
            if path == paths::commission(&address) {
                return Ok(commission_response(&v.commission));
            }
            if path == paths::state(&address) {
                return Ok(state_response(v.state));
            }
        }
        Err(Error::protocol().context(format!("query returned no value: nothing at {path}")))
    }
}

impl NodeClient for MockNodeClient {
    async fn get_height(&self) -> Result<u64> {
        let node = self.node.read().await;
        node.check_available()?;
        ensure!(
            !node.catching_up,
            Error::catching_up().context(format!("mock node at height {} is syncing", node.height))
        );
        Ok(node.height)
    }

    async fn get_validator_set(
        &self,
        height: u64,
        page: usize,
        per_page: usize,
    ) -> Result<ValidatorSetPage> {
        let node = self.node.read().await;
        node.check_available()?;
        ensure!(
            height <= node.height,
            Error::protocol().context(format!("mock error: height {height} is in the future"))
        );
        ensure!(
            page >= 1 && per_page >= 1,
            Error::protocol().context("mock error: invalid page")
        );
        let entries = if node.stall_pagination && page > 1 {
            vec![]
        } else {
            node.validators
                .iter()
                .skip((page - 1) * per_page)
                .take(per_page)
                .map(|v| ValidatorSetEntry {
                    node_address: v.node_address.clone(),
                    voting_power: v.voting_power,
                })
                .collect()
        };
        Ok(ValidatorSetPage {
            entries,
            total: node.validators.len(),
        })
    }

    async fn query_by_path(&self, path: &str) -> Result<Vec<u8>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let node = self.node.read().await;
        node.check_available()?;
        ensure!(
            !node.failing_paths.contains(path),
            Error::unavailable().context(format!("mock error: query {path} failed"))
        );
        node.respond(path)
    }
}
