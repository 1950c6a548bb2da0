use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub api_key: Option<String>,
    pub default_page_size: i64,
    pub max_page_size: i64,
    pub default_across_count: i64,
    pub query_timeout: Duration,
    pub stack_concurrency: usize,
    pub max_stack_depth: usize,
    pub hierarchy_max_depth: usize,
    pub hierarchy_max_nodes: usize,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    reportql_listen_addr: Option<String>,
    #[serde(default)]
    reportql_listen_host: Option<String>,
    #[serde(default)]
    reportql_listen_port: Option<u16>,
    #[serde(default)]
    reportql_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    reportql_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    reportql_api_key: Option<String>,
    #[serde(default = "default_page_size")]
    reportql_default_page_size: i64,
    #[serde(default = "default_max_page_size")]
    reportql_max_page_size: i64,
    #[serde(default = "default_across_count")]
    reportql_default_across_count: i64,
    #[serde(default = "default_timeout_secs")]
    reportql_query_timeout_secs: u64,
    #[serde(default = "default_stack_concurrency")]
    reportql_stack_concurrency: usize,
    #[serde(default = "default_stack_depth")]
    reportql_max_stack_depth: usize,
    #[serde(default = "default_hierarchy_depth")]
    reportql_hierarchy_max_depth: usize,
    #[serde(default = "default_hierarchy_nodes")]
    reportql_hierarchy_max_nodes: usize,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_page_size() -> i64 {
    50
}

const fn default_max_page_size() -> i64 {
    1000
}

const fn default_across_count() -> i64 {
    90
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_stack_concurrency() -> usize {
    4
}

const fn default_stack_depth() -> usize {
    1
}

const fn default_hierarchy_depth() -> usize {
    64
}

const fn default_hierarchy_nodes() -> usize {
    50_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse REPORTQL_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.reportql_listen_addr,
            raw.reportql_listen_host,
            raw.reportql_listen_port,
        )?;

        let database_url = raw
            .reportql_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("REPORTQL_DATABASE_URL or DATABASE_URL must be set")?;

        let default_page_size = raw.reportql_default_page_size.max(1);

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.reportql_max_pool_size.max(1),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            api_key: raw.reportql_api_key,
            default_page_size,
            max_page_size: raw.reportql_max_page_size.max(default_page_size),
            default_across_count: raw.reportql_default_across_count.max(1),
            query_timeout: Duration::from_secs(raw.reportql_query_timeout_secs.max(1)),
            stack_concurrency: raw.reportql_stack_concurrency.max(1),
            max_stack_depth: raw.reportql_max_stack_depth,
            hierarchy_max_depth: raw.reportql_hierarchy_max_depth.max(1),
            hierarchy_max_nodes: raw.reportql_hierarchy_max_nodes.max(1),
        })
    }

    /// Clamps a caller-requested timeout to the configured ceiling.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.query_timeout),
            _ => self.query_timeout,
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid REPORTQL_LISTEN_ADDR value")?
            .next()
            .context("REPORTQL_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid reportql listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgres://example/db".to_string(),
        max_pool_size: 1,
        pg_ssl_root_cert: None,
        pg_ssl_cert: None,
        pg_ssl_key: None,
        api_key: None,
        default_page_size: 50,
        max_page_size: 1000,
        default_across_count: 90,
        query_timeout: Duration::from_secs(30),
        stack_concurrency: 4,
        max_stack_depth: 1,
        hierarchy_max_depth: 64,
        hierarchy_max_nodes: 50_000,
    }
}
