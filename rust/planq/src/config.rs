use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: Option<String>,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub api_key: Option<String>,
    /// Row cap used when a plan runs in exploratory (non-large) mode.
    pub exploratory_row_limit: i64,
    /// Hard ceiling for large mode, validator limit injection and ingestion.
    pub max_returned_rows: i64,
    pub fetch_chunk_size: usize,
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
    pub read_uncommitted: bool,
    pub cache_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub traces_dir: PathBuf,
    /// Holds the append-only query log.
    pub log_dir: PathBuf,
    pub schema_registry_path: PathBuf,
    pub offline_only: bool,
    pub planner_url: Option<String>,
    pub planner_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    planq_listen_addr: Option<String>,
    #[serde(default)]
    planq_listen_host: Option<String>,
    #[serde(default)]
    planq_listen_port: Option<u16>,
    #[serde(default)]
    planq_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    planq_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    planq_api_key: Option<String>,
    #[serde(default = "default_exploratory_rows")]
    planq_exploratory_row_limit: i64,
    #[serde(default = "default_max_rows")]
    planq_max_returned_rows: i64,
    #[serde(default = "default_chunk_size")]
    planq_fetch_chunk_size: usize,
    #[serde(default = "default_statement_timeout_secs")]
    planq_statement_timeout_secs: u64,
    #[serde(default = "default_lock_timeout_ms")]
    planq_lock_timeout_ms: u64,
    #[serde(default = "default_true")]
    planq_read_uncommitted: bool,
    #[serde(default)]
    planq_data_dir: Option<String>,
    #[serde(default)]
    planq_cache_dir: Option<String>,
    #[serde(default)]
    planq_catalog_path: Option<String>,
    #[serde(default)]
    planq_traces_dir: Option<String>,
    #[serde(default)]
    planq_log_dir: Option<String>,
    #[serde(default)]
    planq_schema_registry: Option<String>,
    #[serde(default)]
    planq_offline_only: bool,
    #[serde(default)]
    planq_planner_url: Option<String>,
    #[serde(default = "default_planner_timeout_ms")]
    planq_planner_timeout_ms: u64,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_exploratory_rows() -> i64 {
    10_000
}

const fn default_max_rows() -> i64 {
    200_000
}

const fn default_chunk_size() -> usize {
    50_000
}

const fn default_statement_timeout_secs() -> u64 {
    3_600
}

const fn default_lock_timeout_ms() -> u64 {
    30_000
}

const fn default_planner_timeout_ms() -> u64 {
    30_000
}

const fn default_true() -> bool {
    true
}

const MIN_CHUNK_SIZE: usize = 1_000;
const MAX_CHUNK_SIZE: usize = 200_000;

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse PLANQ_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.planq_listen_addr,
            raw.planq_listen_host,
            raw.planq_listen_port,
        )?;

        let database_url = raw
            .planq_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok());

        if database_url.is_none() && !raw.planq_offline_only {
            anyhow::bail!(
                "PLANQ_DATABASE_URL or DATABASE_URL must be set unless PLANQ_OFFLINE_ONLY=true"
            );
        }

        let data_dir = PathBuf::from(raw.planq_data_dir.unwrap_or_else(|| ".".to_string()));
        let cache_dir = raw
            .planq_cache_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("cache_data"));
        let catalog_path = raw
            .planq_catalog_path
            .map(PathBuf::from)
            .unwrap_or_else(|| cache_dir.join("catalog.sqlite"));
        let traces_dir = raw
            .planq_traces_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("traces_data"));
        let log_dir = raw
            .planq_log_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));
        let schema_registry_path = raw
            .planq_schema_registry
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("knowledge_graph_data/schema_registry.json"));

        let exploratory_row_limit = raw.planq_exploratory_row_limit.max(1);

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.planq_max_pool_size.max(1),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            api_key: raw.planq_api_key,
            exploratory_row_limit,
            max_returned_rows: raw.planq_max_returned_rows.max(exploratory_row_limit),
            fetch_chunk_size: raw
                .planq_fetch_chunk_size
                .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            statement_timeout: Duration::from_secs(raw.planq_statement_timeout_secs.max(1)),
            lock_timeout: Duration::from_millis(raw.planq_lock_timeout_ms),
            read_uncommitted: raw.planq_read_uncommitted,
            cache_dir,
            catalog_path,
            traces_dir,
            log_dir,
            schema_registry_path,
            offline_only: raw.planq_offline_only,
            planner_url: raw.planq_planner_url,
            planner_timeout: Duration::from_millis(raw.planq_planner_timeout_ms.max(1)),
        })
    }

    /// Configuration rooted at a single directory with no source database,
    /// used by tests and offline tooling.
    pub fn embedded(data_dir: &Path) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url: None,
            max_pool_size: 1,
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            api_key: None,
            exploratory_row_limit: default_exploratory_rows(),
            max_returned_rows: default_max_rows(),
            fetch_chunk_size: default_chunk_size(),
            statement_timeout: Duration::from_secs(default_statement_timeout_secs()),
            lock_timeout: Duration::from_millis(default_lock_timeout_ms()),
            read_uncommitted: true,
            cache_dir: data_dir.join("cache_data"),
            catalog_path: data_dir.join("cache_data").join("catalog.sqlite"),
            traces_dir: data_dir.join("traces_data"),
            log_dir: data_dir.join("logs"),
            schema_registry_path: data_dir.join("schema_registry.json"),
            offline_only: false,
            planner_url: None,
            planner_timeout: Duration::from_millis(default_planner_timeout_ms()),
        }
    }

    /// Row cap for the requested mode.
    pub fn row_cap(&self, large_mode: bool) -> i64 {
        if large_mode {
            self.max_returned_rows
        } else {
            self.exploratory_row_limit
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let catalog_dir = self.catalog_path.parent().map(Path::to_path_buf);
        for dir in [
            Some(self.cache_dir.clone()),
            Some(self.traces_dir.clone()),
            Some(self.log_dir.clone()),
            catalog_dir,
        ]
            .into_iter()
            .flatten()
        {
            if dir.as_os_str().is_empty() {
                continue;
            }
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
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
            .context("invalid PLANQ_LISTEN_ADDR value")?
            .next()
            .context("PLANQ_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid planq listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "PLANQ_DATABASE_URL",
        "DATABASE_URL",
        "PLANQ_OFFLINE_ONLY",
        "PLANQ_FETCH_CHUNK_SIZE",
        "PLANQ_EXPLORATORY_ROW_LIMIT",
        "PLANQ_MAX_RETURNED_ROWS",
        "PLANQ_DATA_DIR",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn requires_database_url_unless_offline() {
        clear_env();
        assert!(AppConfig::from_env().is_err());

        env::set_var("PLANQ_OFFLINE_ONLY", "true");
        let config = AppConfig::from_env().expect("offline config should load");
        assert!(config.offline_only);
        assert!(config.database_url.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn clamps_chunk_size_and_row_ceilings() {
        clear_env();
        env::set_var("PLANQ_DATABASE_URL", "postgres://example/db");
        env::set_var("PLANQ_FETCH_CHUNK_SIZE", "10");
        env::set_var("PLANQ_EXPLORATORY_ROW_LIMIT", "500");
        env::set_var("PLANQ_MAX_RETURNED_ROWS", "100");
        env::set_var("PLANQ_DATA_DIR", "/tmp/planq");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.fetch_chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(config.exploratory_row_limit, 500);
        assert_eq!(config.max_returned_rows, 500);
        assert_eq!(config.row_cap(false), 500);
        assert_eq!(
            config.catalog_path,
            PathBuf::from("/tmp/planq/cache_data/catalog.sqlite")
        );
        assert_eq!(config.log_dir, PathBuf::from("/tmp/planq/logs"));
        clear_env();
    }
}
