//! PostgreSQL pool and the [`Storage`] implementation backed by it.

use crate::{
    config::AppConfig,
    error::{Result as ServiceResult, ServiceError},
    query::{BindParam, CompiledQuery},
    storage::{Row, Storage},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_query;
use diesel::sql_types::Jsonb;
use diesel::deserialize::QueryableByName;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info, warn};

pub type PgPool = Pool<PgConnectionManager>;

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let manager = PgConnectionManager::new(config)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    // Report bad credentials at startup; the pool keeps retrying afterwards.
    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
}

impl PgConnectionManager {
    fn new(config: &AppConfig) -> Result<Self> {
        let pg = config
            .database_url
            .parse::<PgConfig>()
            .context("invalid database url")?;
        let tls = config
            .pg_ssl_root_cert
            .as_deref()
            .map(|root| {
                tls_connector(
                    root,
                    config.pg_ssl_cert.as_deref(),
                    config.pg_ssl_key.as_deref(),
                )
            })
            .transpose()?;
        Ok(Self { config: pg, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = match &self.tls {
            None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
            Some(connector) => {
                let (client, connection) = self.config.connect(connector.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
        };
        conn.map_err(|err| anyhow::anyhow!(err))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

fn tls_connector(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(root_cert, "PGSSLROOTCERT")? {
        roots
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (client_cert, client_key) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert, "PGSSLCERT")?, read_key(key)?)
            .with_context(|| format!("failed to build client TLS config for {root_cert}"))?,
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
    };
    Ok(MakeRustlsConnect::new(config))
}

fn read_certs(path: &str, source: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open {source} file '{path}'"))?,
    );
    let chain = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {source}"))?;
    if chain.is_empty() {
        anyhow::bail!("{source} contained no certificates");
    }
    Ok(chain)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")
}

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    row: Value,
}

/// Executes compiled statements through the pool; every result row is folded to one JSON object.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn fetch(&self, query: &CompiledQuery) -> ServiceResult<Vec<Row>> {
        let mut conn = self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            ServiceError::Storage("database unavailable".to_string())
        })?;

        let mut statement = sql_query(wrap_statement(query)).into_boxed::<Pg>();
        for param in &query.params {
            statement = bind(statement, param);
        }

        let rows: Vec<JsonRow> = statement.load(&mut *conn).await.map_err(|err| {
            error!(error = ?err, sql = %query.sql, "report query failed");
            ServiceError::Storage(err.to_string())
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row.row {
                Value::Object(map) => Some(map),
                other => {
                    warn!(value = %other, "discarding non-object result row");
                    None
                }
            })
            .collect())
    }
}

/// Folds each row to jsonb. The outer query restates the ordering since the subquery's is not kept.
fn wrap_statement(query: &CompiledQuery) -> String {
    match &query.order {
        Some(order) => format!(
            "SELECT to_jsonb(q) AS row FROM ({}) q ORDER BY {order}",
            query.sql
        ),
        None => format!("SELECT to_jsonb(q) AS row FROM ({}) q", query.sql),
    }
}

fn bind<'a>(
    query: BoxedSqlQuery<'a, Pg, SqlQuery>,
    param: &BindParam,
) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
    use diesel::sql_types::{Array, Bool, Float8, Int8, Text, Timestamptz, Uuid};
    match param {
        BindParam::Text(value) => query.bind::<Text, _>(value.clone()),
        BindParam::TextArray(values) => query.bind::<Array<Text>, _>(values.clone()),
        BindParam::Int(value) => query.bind::<Int8, _>(*value),
        BindParam::IntArray(values) => query.bind::<Array<Int8>, _>(values.clone()),
        BindParam::Bool(value) => query.bind::<Bool, _>(*value),
        BindParam::Float(value) => query.bind::<Float8, _>(*value),
        BindParam::Timestamptz(value) => query.bind::<Timestamptz, _>(*value),
        BindParam::Uuid(value) => query.bind::<Uuid, _>(*value),
        BindParam::UuidArray(values) => query.bind::<Array<Uuid>, _>(values.clone()),
    }
}
