use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::time::sleep;
use tracing::instrument;

use super::{
    AbciQueryResult, NodeClient, StatusResult, ValidatorSetPage, ValidatorsResult, parse_response,
};
use crate::{
    Error, Result,
    error::ResultExt,
    types::common::DEFAULT_ADDRESS_PREFIX,
};

/// Statuses worth retrying: the node is overloaded or restarting.
const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Configuration for querying a chain node.
#[derive(Clone, Debug, Parser)]
pub struct RpcOptions {
    /// URL of the node's RPC endpoint.
    #[clap(long = "rpc-url", env = "VALIDATOR_WATCH_RPC_URL")]
    pub url: Url,

    /// Retries for a request which fails with a connection error or a transient status.
    #[clap(long, env = "VALIDATOR_WATCH_RPC_RETRIES", default_value = "3")]
    pub rpc_retries: u32,

    /// Delay before the first retry. Each further retry doubles the delay.
    #[clap(
        long,
        env = "VALIDATOR_WATCH_RPC_BACKOFF",
        default_value = "300ms",
        value_parser = humantime::parse_duration,
    )]
    pub rpc_backoff: Duration,

    /// Timeout for a single request.
    #[clap(
        long,
        env = "VALIDATOR_WATCH_RPC_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub rpc_timeout: Duration,

    /// Number of validators requested per page of the validator set.
    #[clap(long, env = "VALIDATOR_WATCH_PAGE_SIZE", default_value = "100")]
    pub page_size: usize,

    /// Maximum number of validators queried concurrently.
    #[clap(long, env = "VALIDATOR_WATCH_QUERY_CONCURRENCY", default_value = "8")]
    pub query_concurrency: usize,

    /// Human-readable prefix of validator addresses on this network.
    #[clap(
        long,
        env = "VALIDATOR_WATCH_ADDRESS_PREFIX",
        default_value = DEFAULT_ADDRESS_PREFIX,
    )]
    pub address_prefix: String,
}

impl RpcOptions {
    /// Options to connect to the given URL, with default values for optional parameters.
    pub fn new(url: Url) -> Self {
        RpcOptions::parse_from(["--", "--rpc-url", url.as_str()])
    }
}

/// A [`NodeClient`] talking to a CometBFT RPC endpoint over HTTP.
#[derive(Clone, Debug)]
pub struct HttpNodeClient {
    http: reqwest::Client,
    base: Url,
    retries: u32,
    backoff: Duration,
    next_id: Arc<AtomicU64>,
}

impl HttpNodeClient {
    pub fn new(opt: &RpcOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(opt.rpc_timeout)
            .build()?;

        // Endpoints are joined onto the base, which only keeps the last path segment if it ends
        // in a slash.
        let mut base = opt.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            http,
            base,
            retries: opt.rpc_retries,
            backoff: opt.rpc_backoff,
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        self.base
            .join(endpoint)
            .context(|| Error::internal().context(format!("invalid endpoint {endpoint}")))
    }

    /// Send a request, retrying transient failures with exponential backoff.
    async fn send(&self, request: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let res = request().send().await;
            let transient = match &res {
                Ok(resp) => RETRY_STATUSES.contains(&resp.status()),
                Err(err) => err.is_connect() || err.is_timeout(),
            };
            if !transient || attempt >= self.retries {
                return Ok(res?.error_for_status()?);
            }

            let delay = self.backoff * 2u32.saturating_pow(attempt);
            match &res {
                Ok(resp) => {
                    tracing::warn!(attempt, ?delay, status = %resp.status(), "node request failed, retrying")
                }
                Err(err) => tracing::warn!(attempt, ?delay, "node request failed, retrying: {err}"),
            }
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(endpoint)?;
        let resp = self
            .send(|| self.http.get(url.clone()).query(query))
            .await?;
        parse_response(&resp.bytes().await?)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let resp = self
            .send(|| self.http.post(self.base.clone()).json(&body))
            .await?;
        parse_response(&resp.bytes().await?)
    }
}

impl NodeClient for HttpNodeClient {
    #[instrument(skip(self))]
    async fn get_height(&self) -> Result<u64> {
        let status: StatusResult = self.get("status", &[]).await?;
        status.height()
    }

    #[instrument(skip(self))]
    async fn get_validator_set(
        &self,
        height: u64,
        page: usize,
        per_page: usize,
    ) -> Result<ValidatorSetPage> {
        let res: ValidatorsResult = self
            .get(
                "validators",
                &[
                    ("height", height.to_string()),
                    ("page", page.to_string()),
                    ("per_page", per_page.to_string()),
                ],
            )
            .await?;
        res.try_into()
    }

    async fn query_by_path(&self, path: &str) -> Result<Vec<u8>> {
        let res: AbciQueryResult = self
            .call("abci_query", json!({ "path": path }))
            .await
            .map_err(|err| err.context(format!("querying {path}")))?;
        res.response
            .into_value()
            .map_err(|err| err.context(format!("querying {path}")))
    }
}
