//! Prometheus metrics, exposed over HTTP for scraping.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total backend connections dialed
    pub backend_connections_total: IntCounter,
    /// Commands routed to a backend
    pub queries_routed_total: IntCounter,
    /// Replies that carried an error packet
    pub query_errors_total: IntCounter,
    /// Monitor health check results
    pub health_checks_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "bifrost_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "bifrost_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let backend_connections_total = IntCounter::new(
            "bifrost_backend_connections_total",
            "Total number of backend connections dialed",
        )
        .unwrap();

        let queries_routed_total = IntCounter::new(
            "bifrost_queries_routed_total",
            "Total number of client commands routed to a backend",
        )
        .unwrap();

        let query_errors_total = IntCounter::new(
            "bifrost_query_errors_total",
            "Total number of replies carrying an error packet",
        )
        .unwrap();

        let health_checks_total = IntCounterVec::new(
            Opts::new(
                "bifrost_health_checks_total",
                "Monitor health check results",
            ),
            &["result"],
        )
        .unwrap();

        registry.register(Box::new(connections_total.clone())).unwrap();
        registry.register(Box::new(connections_active.clone())).unwrap();
        registry
            .register(Box::new(backend_connections_total.clone()))
            .unwrap();
        registry.register(Box::new(queries_routed_total.clone())).unwrap();
        registry.register(Box::new(query_errors_total.clone())).unwrap();
        registry.register(Box::new(health_checks_total.clone())).unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            backend_connections_total,
            queries_routed_total,
            query_errors_total,
            health_checks_total,
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn record_backend_connection(&self) {
        self.backend_connections_total.inc();
    }

    pub fn record_query_routed(&self) {
        self.queries_routed_total.inc();
    }

    pub fn record_query_error(&self) {
        self.query_errors_total.inc();
    }

    pub fn record_health_check(&self, reachable: bool) {
        let result = if reachable { "success" } else { "failure" };
        self.health_checks_total.with_label_values(&[result]).inc();
    }

    /// Metrics in Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

/// Serve `/metrics` and `/health` on `addr`
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
