//! Prometheus metrics for the validator watch service, and the HTTP endpoint serving them.

use std::convert::Infallible;

use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Bytes,
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Gauge, IntCounter, Opts, Registry, TEXT_FORMAT, TextEncoder};
use tokio::{net::TcpListener, task::spawn};

/// Prometheus metrics for the validator watch service.
#[derive(Clone, Debug)]
pub struct PrometheusMetrics {
    registry: Registry,

    // Change cycle metrics
    /// Block height of the latest successful snapshot.
    pub latest_height: Gauge,
    /// Number of validators fetched in the latest snapshot.
    pub tracked_validators: Gauge,
    /// Number of validators skipped in the latest snapshot.
    pub skipped_validators: Gauge,
    /// Change records created since startup.
    pub change_records_created: IntCounter,
    /// Snapshot cycles aborted because the node was unusable.
    pub aborted_cycles: IntCounter,

    // Notify cycle metrics
    /// Messages delivered to subscribers since startup.
    pub notifications_delivered: IntCounter,
    /// Messages which could not be delivered after all retries.
    pub notification_failures: IntCounter,
    /// Change records left unsent after the latest notify cycle.
    pub pending_change_records: Gauge,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let gauge = Gauge::with_opts(Opts::new(name, help))
        .unwrap_or_else(|err| panic!("failed to create {name} gauge: {err}"));
    registry
        .register(Box::new(gauge.clone()))
        .unwrap_or_else(|err| panic!("failed to register {name} gauge: {err}"));
    gauge
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|err| panic!("failed to create {name} counter: {err}"));
    registry
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|err| panic!("failed to register {name} counter: {err}"));
    counter
}

impl PrometheusMetrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let latest_height = gauge(
            &registry,
            "latest_height",
            "Block height of the latest successful validator snapshot",
        );
        let tracked_validators = gauge(
            &registry,
            "tracked_validators",
            "Number of validators fetched in the latest snapshot",
        );
        let skipped_validators = gauge(
            &registry,
            "skipped_validators",
            "Number of validators skipped in the latest snapshot",
        );
        let change_records_created = counter(
            &registry,
            "change_records_created",
            "Change records created since startup",
        );
        let aborted_cycles = counter(
            &registry,
            "aborted_cycles",
            "Snapshot cycles aborted because the node was unusable",
        );

        let notifications_delivered = counter(
            &registry,
            "notifications_delivered",
            "Messages delivered to subscribers since startup",
        );
        let notification_failures = counter(
            &registry,
            "notification_failures",
            "Messages which could not be delivered after all retries",
        );
        let pending_change_records = gauge(
            &registry,
            "pending_change_records",
            "Change records left unsent after the latest notify cycle",
        );

        Self {
            registry,
            latest_height,
            tracked_validators,
            skipped_validators,
            change_records_created,
            aborted_cycles,
            notifications_delivered,
            notification_failures,
            pending_change_records,
        }
    }

    /// Render all metrics in the Prometheus text format.
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| {
            prometheus::Error::Msg(format!("metrics output is not valid UTF-8: {err}"))
        })
    }

    fn respond<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET || req.uri().path() != "/metrics" {
            let mut res = Response::new(Full::new(Bytes::from_static(b"not found\n")));
            *res.status_mut() = StatusCode::NOT_FOUND;
            return res;
        }
        match self.export() {
            Ok(text) => {
                let mut res = Response::new(Full::new(Bytes::from(text)));
                res.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                res
            }
            Err(err) => {
                tracing::error!("failed to export metrics: {err}");
                let mut res = Response::new(Full::new(Bytes::from(err.to_string())));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        }
    }

    /// Serve `GET /metrics` on `listener` until the task is dropped.
    ///
    /// Every other request gets a 404.
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "serving metrics");
        }
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!("failed to accept metrics connection: {err}");
                    continue;
                }
            };
            let metrics = self.clone();
            spawn(async move {
                let service = service_fn(move |req| {
                    let res = metrics.respond(&req);
                    async move { Ok::<_, Infallible>(res) }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(%peer, "metrics connection failed: {err}");
                }
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_export() {
        let metrics = PrometheusMetrics::new();
        metrics.latest_height.set(42.0);
        metrics.change_records_created.inc_by(3);

        let text = metrics.export().unwrap();
        assert!(text.contains("latest_height 42"), "{text}");
        assert!(text.contains("change_records_created 3"), "{text}");
        assert!(text.contains("# TYPE aborted_cycles counter"), "{text}");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_serve() {
        let metrics = PrometheusMetrics::new();
        metrics.latest_height.set(7.0);
        metrics.notifications_delivered.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = spawn(metrics.clone().serve(listener));

        let res = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::OK);
        assert_eq!(
            res.headers()[reqwest::header::CONTENT_TYPE],
            TEXT_FORMAT
        );
        let text = res.text().await.unwrap();
        assert!(text.contains("latest_height 7"), "{text}");
        assert!(text.contains("notifications_delivered 1"), "{text}");

        // Updates after startup are visible on the next scrape.
        metrics.latest_height.set(8.0);
        let text = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("latest_height 8"), "{text}");

        let res = reqwest::get(format!("http://{addr}/status")).await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);

        server.abort();
    }
}
