//! Assembly of one snapshot per validator from a node's state queries.

use std::{collections::HashSet, sync::Arc};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::instrument;

use super::rpc::{NodeClient, ValidatorSetEntry, ValidatorSetPage, client::RpcOptions, paths};
use crate::{
    Error, Result,
    codec::binary,
    error::ensure,
    types::{
        common::{NodeAddress, ValidatorAddress},
        validator::ValidatorSnapshot,
    },
};

/// The outcome of one snapshot cycle.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCycle {
    /// The height all queries were answered at.
    pub height: u64,

    /// Every validator whose attributes were fully decoded.
    pub snapshots: Vec<ValidatorSnapshot>,

    /// Validators in the set for which some query or decode failed.
    pub skipped: Vec<NodeAddress>,
}

/// Fetches validator snapshots from a node.
#[derive(Clone, Debug)]
pub struct SnapshotFetcher<C> {
    client: C,
    page_size: usize,
    concurrency: usize,
    prefix: String,
}

impl<C: NodeClient> SnapshotFetcher<C> {
    pub fn new(client: C, opt: &RpcOptions) -> Self {
        Self {
            client,
            page_size: opt.page_size.max(1),
            concurrency: opt.query_concurrency.max(1),
            prefix: opt.address_prefix.clone(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Fetch a snapshot of every validator in the current set.
    ///
    /// Fails as a whole only if the height or the validator set cannot be obtained. A validator
    /// whose own queries fail is left out of the snapshots and listed in
    /// [`skipped`](SnapshotCycle::skipped).
    #[instrument(skip(self))]
    pub async fn fetch_cycle(&self) -> Result<SnapshotCycle> {
        let height = self.client.get_height().await?;
        let validator_set = self.validator_set(height).await?;
        tracing::info!(height, validators = validator_set.len(), "fetching validator snapshots");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let futures = validator_set.into_iter().map(|entry| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let res = match semaphore.acquire().await {
                    Ok(_permit) => self.fetch_validator(&entry).await,
                    Err(err) => Err(Error::internal().context(err)),
                };
                (entry, res)
            }
        });

        let mut cycle = SnapshotCycle {
            height,
            ..Default::default()
        };
        for (entry, res) in join_all(futures).await {
            match res {
                Ok(snapshot) => cycle.snapshots.push(snapshot),
                Err(err) => {
                    tracing::warn!(node_address = %entry.node_address, "skipping validator: {err}");
                    cycle.skipped.push(entry.node_address);
                }
            }
        }
        Ok(cycle)
    }

    /// Page through the validator set at `height`.
    async fn validator_set(&self, height: u64) -> Result<Vec<ValidatorSetEntry>> {
        let mut entries = vec![];
        let mut seen = HashSet::new();
        let mut page = 1;
        loop {
            let ValidatorSetPage { entries: batch, total } = self
                .client
                .get_validator_set(height, page, self.page_size)
                .await?;
            if entries.len() >= total {
                break;
            }

            let before = entries.len();
            for entry in batch {
                if seen.insert(entry.node_address.clone()) {
                    entries.push(entry);
                }
            }
            ensure!(
                entries.len() > before,
                Error::protocol().context(format!(
                    "page {page} of the validator set at height {height} has no new entries \
                     ({} of {total} seen)",
                    entries.len()
                ))
            );
            if entries.len() >= total {
                break;
            }
            page += 1;
        }
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(node_address = %entry.node_address))]
    async fn fetch_validator(&self, entry: &ValidatorSetEntry) -> Result<ValidatorSnapshot> {
        let raw = self
            .query(
                paths::validator_by_node(&entry.node_address),
                "address",
                binary::decode_address,
            )
            .await?;
        let validator_address = ValidatorAddress::encode(&raw.flip_tag(), &self.prefix)?;

        let (metadata, commission, state) = tokio::join!(
            self.query(
                paths::metadata(&validator_address),
                "metadata",
                binary::decode_metadata_response,
            ),
            self.query(
                paths::commission(&validator_address),
                "commission",
                binary::decode_commission,
            ),
            self.query(
                paths::state(&validator_address),
                "state",
                binary::decode_state,
            ),
        );

        Ok(ValidatorSnapshot {
            node_address: entry.node_address.clone(),
            validator_address,
            voting_power: entry.voting_power,
            metadata: metadata?,
            commission: commission?,
            state: state?,
        })
    }

    /// Query one path and decode the result, logging any failure against the field it was for.
    async fn query<T>(
        &self,
        path: String,
        field: &'static str,
        decode: fn(&[u8]) -> Result<T>,
    ) -> Result<T> {
        let res = self
            .client
            .query_by_path(&path)
            .await
            .and_then(|bytes| decode(&bytes));
        if let Err(err) = &res {
            tracing::error!(field, %path, "validator query failed: {err}");
        }
        res.map_err(|err| err.context(field))
    }
}
