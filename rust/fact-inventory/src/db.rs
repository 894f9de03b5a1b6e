//! PostgreSQL pool for the fact store.
//!
//! Connections go through tokio-postgres (plain or rustls) and are wrapped
//! as diesel-async connections inside a bb8 pool.

use crate::config::AppConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel_async::pooled_connection::PoolableConnection;
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::{fs::File, io::BufReader, time::Duration};
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};

pub type PgPool = Pool<PgConnectionManager>;

/// Idempotent DDL for the `host_facts` table and its indexes.
pub const SCHEMA_SQL: &str = include_str!("../migrations/host_facts.sql");

/// Longest a submission waits for a pooled connection before its write is
/// reported as storage-unavailable.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let manager = PgConnectionManager::new(&config.database_url, tls_connector(config)?)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .connection_timeout(CHECKOUT_TIMEOUT)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    match pool.get().await {
        Ok(_) => info!(max_size = config.max_pool_size, "connected to PostgreSQL"),
        // Schema setup runs next and cannot proceed without a connection.
        Err(err) if config.auto_migrate => {
            return Err(anyhow!("PostgreSQL unreachable at startup: {err:?}"));
        }
        Err(err) => warn!(
            error = ?err,
            "PostgreSQL unreachable at startup; submissions will fail until it recovers"
        ),
    }

    Ok(pool)
}

pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|err| anyhow!("failed to acquire connection for schema setup: {err:?}"))?;
    conn.batch_execute(SCHEMA_SQL)
        .await
        .context("failed to apply host_facts schema")?;
    info!("host_facts schema is up to date");
    Ok(())
}

pub struct PgConnectionManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
}

impl PgConnectionManager {
    fn new(database_url: &str, tls: Option<MakeRustlsConnect>) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid FACTS_DATABASE_URL")?;
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = match &self.tls {
            Some(tls) => {
                let (client, connection) = self
                    .config
                    .connect(tls.clone())
                    .await
                    .context("TLS connection to PostgreSQL failed")?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
            None => {
                let (client, connection) = self
                    .config
                    .connect(NoTls)
                    .await
                    .context("connection to PostgreSQL failed")?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
        };
        conn.context("failed to set up diesel connection")
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1")
            .await
            .context("pooled connection failed validation")
    }

    /// A connection whose transaction state was left broken by a failed
    /// query is not handed out again.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        PoolableConnection::is_broken(conn)
    }
}

fn tls_connector(config: &AppConfig) -> Result<Option<MakeRustlsConnect>> {
    let client_auth = match (config.pg_ssl_cert.as_deref(), config.pg_ssl_key.as_deref()) {
        (None, None) => None,
        (Some(cert), Some(key)) => Some((cert, key)),
        _ => bail!("PGSSLCERT and PGSSLKEY must be set together"),
    };

    let Some(root) = config.pg_ssl_root_cert.as_deref() else {
        if client_auth.is_some() {
            warn!("PGSSLCERT/PGSSLKEY ignored because PGSSLROOTCERT is not set");
        }
        return Ok(None);
    };

    let mut roots = RootCertStore::empty();
    for cert in read_certs(root, "PGSSLROOTCERT")? {
        roots
            .add(cert)
            .with_context(|| format!("PGSSLROOTCERT: '{root}' holds an unusable certificate"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let client_config = match client_auth {
        None => builder.with_no_client_auth(),
        Some((cert, key)) => builder
            .with_client_auth_cert(read_certs(cert, "PGSSLCERT")?, read_key(key)?)
            .context("PGSSLCERT and PGSSLKEY do not form a usable client identity")?,
    };
    Ok(Some(MakeRustlsConnect::new(client_config)))
}

fn read_certs(path: &str, var: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("{var}: cannot open '{path}'"))?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("{var}: '{path}' is not valid PEM"))?;
    if chain.is_empty() {
        bail!("{var}: '{path}' contains no certificates");
    }
    Ok(chain)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("PGSSLKEY: cannot open '{path}'"))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("PGSSLKEY: '{path}' is not valid PEM"))?
        .with_context(|| format!("PGSSLKEY: '{path}' contains no private key"))
}
