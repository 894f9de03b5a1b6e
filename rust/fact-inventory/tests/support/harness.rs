#![allow(dead_code)]

use axum::{
    body::{self, Body},
    extract::ConnectInfo,
    http::{self, Request, StatusCode},
    Router,
};
use fact_inventory::{
    config::{AppConfig, RateLimitConfig, SubmissionLimits},
    db,
    repository::{FactRepository, MemoryFactRepository, PgFactRepository},
    server::Server,
};
use serde_json::Value;
use parking_lot::Mutex;
use std::{env, future::Future, io, net::SocketAddr, sync::Arc, sync::Once, time::Duration};
use tower::ServiceExt;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub fn test_config(database_url: &str) -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        database_url: database_url.to_string(),
        max_pool_size: 5,
        pg_ssl_root_cert: env::var("PGSSLROOTCERT").ok(),
        pg_ssl_cert: env::var("PGSSLCERT").ok(),
        pg_ssl_key: env::var("PGSSLKEY").ok(),
        auto_migrate: true,
        limits: SubmissionLimits {
            max_field_bytes: 4 * 1024,
            max_body_bytes: 16 * 1024,
        },
        rate_limit: RateLimitConfig {
            interval: Duration::from_secs(27 * 60),
            storage_retry_cooldown: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        },
        trust_forwarded_for: false,
    }
}

/// Runs a test closure against the router backed by the in-memory store.
pub async fn with_memory_harness<F, Fut>(test: F)
where
    F: FnOnce(FactsTestHarness<MemoryFactRepository>) -> Fut,
    Fut: Future<Output = ()>,
{
    with_memory_harness_config(test_config("memory://"), test).await;
}

pub async fn with_memory_harness_config<F, Fut>(config: AppConfig, test: F)
where
    F: FnOnce(FactsTestHarness<MemoryFactRepository>) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();
    let repository = Arc::new(MemoryFactRepository::new());
    test(FactsTestHarness::new(config, repository)).await;
}

/// Runs a test closure against a live PostgreSQL database. Skips when
/// `FACTS_TEST_DATABASE_URL` is not set.
pub async fn with_postgres_harness<F, Fut>(test: F)
where
    F: FnOnce(FactsTestHarness<PgFactRepository>) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();
    let database_url = match env::var("FACTS_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("[facts-test] skipping postgres harness: FACTS_TEST_DATABASE_URL is not set");
            return;
        }
    };

    let config = test_config(&database_url);
    let pool = db::connect_pool(&config)
        .await
        .expect("failed to build test pool");
    db::apply_schema(&pool)
        .await
        .expect("failed to apply schema to test database");
    reset_table(&pool).await;

    let repository = Arc::new(PgFactRepository::new(pool));
    test(FactsTestHarness::new(config, repository)).await;
}

async fn reset_table(pool: &db::PgPool) {
    use diesel_async::SimpleAsyncConnection;

    let mut conn = pool.get().await.expect("test connection");
    conn.batch_execute("TRUNCATE host_facts")
        .await
        .expect("failed to truncate host_facts");
}

pub struct FactsTestHarness<R> {
    router: Router,
    repository: Arc<R>,
}

impl<R> FactsTestHarness<R>
where
    R: FactRepository + 'static,
{
    fn new(config: AppConfig, repository: Arc<R>) -> Self {
        let shared: Arc<dyn FactRepository> = repository.clone();
        let server = Server::with_repository(config, shared);
        Self {
            router: server.router(),
            repository,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub async fn submit(&self, peer: &str, payload: &Value) -> http::Response<Body> {
        let body = serde_json::to_vec(payload).expect("payload should serialize");
        self.submit_raw(peer, body, &[]).await
    }

    pub async fn submit_raw(
        &self,
        peer: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> http::Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/facts")
            .header(http::header::CONTENT_TYPE, "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let mut request = builder
            .body(Body::from(body))
            .expect("failed to build harness request");
        if let Ok(addr) = peer.parse::<SocketAddr>() {
            request.extensions_mut().insert(ConnectInfo(addr));
        }

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

/// Log output captured from a thread-local subscriber.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Route this thread's tracing events into the buffer until the guard drops.
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let logs = Self::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
