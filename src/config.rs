use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqlCredentials {
    #[serde(default = "default_sql_user")]
    pub user: String,
    #[serde(default = "default_sql_password")]
    pub password: String,
    #[serde(default = "default_sql_database")]
    pub database: String,
}

impl Default for SqlCredentials {
    fn default() -> Self {
        Self {
            user: default_sql_user(),
            password: default_sql_password(),
            database: default_sql_database(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_listen")]
    pub listen: String,
    #[serde(default = "default_ledger_metrics_listen")]
    pub metrics_listen: String,
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub leader: Option<String>,
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            listen: default_ledger_listen(),
            metrics_listen: default_ledger_metrics_listen(),
            data_path: default_data_path(),
            peers: Vec::new(),
            leader: None,
            replication_timeout_ms: default_replication_timeout_ms(),
        }
    }
}

impl LedgerConfig {
    /// A node with no configured leader considers itself the leader.
    pub fn leader_addr(&self) -> String {
        self.leader.clone().unwrap_or_else(|| self.listen.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_router_listen")]
    pub listen: String,
    #[serde(default = "default_router_metrics_listen")]
    pub metrics_listen: String,
    #[serde(default = "default_ledger_addr")]
    pub ledger_addr: String,
    #[serde(default = "default_range_id")]
    pub range_id: String,
    #[serde(default = "default_owners")]
    pub owners: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: i64,
    #[serde(default)]
    pub sql: SqlCredentials,
    #[serde(default = "default_admin_sql")]
    pub admin_sql: SqlCredentials,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen: default_router_listen(),
            metrics_listen: default_router_metrics_listen(),
            ledger_addr: default_ledger_addr(),
            range_id: default_range_id(),
            owners: default_owners(),
            request_timeout_ms: default_request_timeout_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            sql: SqlCredentials::default(),
            admin_sql: default_admin_sql(),
        }
    }
}

impl RouterConfig {
    pub fn owner_map(&self) -> HashMap<String, String> {
        parse_owner_map(&self.owners)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_metrics_listen")]
    pub metrics_listen: String,
    #[serde(default = "default_ledger_addr")]
    pub ledger_addr: String,
    #[serde(default = "default_sql_host")]
    pub sql_host: String,
    #[serde(default = "default_sql_port")]
    pub sql_port: u16,
    #[serde(default = "default_agent_sql")]
    pub sql: SqlCredentials,
    #[serde(default = "default_start_commit_index")]
    pub start_commit_index: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            metrics_listen: default_agent_metrics_listen(),
            ledger_addr: default_ledger_addr(),
            sql_host: default_sql_host(),
            sql_port: default_sql_port(),
            sql: default_agent_sql(),
            start_commit_index: default_start_commit_index(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub ledger: Option<LedgerConfig>,
    #[serde(default)]
    pub router: Option<RouterConfig>,
    #[serde(default)]
    pub agent: Option<AgentConfig>,
}

impl AppConfig {
    /// Loads the shared config file. A missing file yields defaults; a
    /// file that exists but does not parse is a startup failure.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let Some(path) = explicit.or_else(resolve_config_path) else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// Parses the `owner_id=host:port,owner_id=host:port` map format.
/// Entries without an `=` are dropped.
pub fn parse_owner_map(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((owner, host)) = entry.split_once('=') {
            out.insert(owner.trim().to_string(), host.trim().to_string());
        }
    }
    out
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = std::env::var("FENCELINE_CONFIG_PATH") {
        let path = PathBuf::from(custom);
        if path.exists() {
            return Some(path);
        }
    }
    let cwd = std::env::current_dir().ok()?;
    let direct = cwd.join("fenceline.config.yaml");
    if direct.exists() {
        return Some(direct);
    }
    None
}

fn default_ledger_listen() -> String {
    "0.0.0.0:7000".to_string()
}

fn default_ledger_metrics_listen() -> String {
    "0.0.0.0:7001".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/fenceline/ledger.json")
}

fn default_replication_timeout_ms() -> u64 {
    2_000
}

fn default_router_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_router_metrics_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_agent_metrics_listen() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_ledger_addr() -> String {
    "http://ledger1:7000".to_string()
}

fn default_range_id() -> String {
    "demo.accounts:FULL".to_string()
}

fn default_owners() -> String {
    "mysql1=mysql1:3306".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_lease_ttl_ms() -> i64 {
    30_000
}

fn default_sql_user() -> String {
    "fenceline_router".to_string()
}

fn default_sql_password() -> String {
    "router".to_string()
}

fn default_sql_database() -> String {
    "demo".to_string()
}

fn default_sql_host() -> String {
    "mysql1".to_string()
}

fn default_sql_port() -> u16 {
    3306
}

fn default_admin_sql() -> SqlCredentials {
    SqlCredentials {
        user: "root".to_string(),
        password: "root".to_string(),
        database: "mysql".to_string(),
    }
}

fn default_agent_sql() -> SqlCredentials {
    SqlCredentials {
        user: "fenceline_apply".to_string(),
        password: "apply".to_string(),
        database: "demo".to_string(),
    }
}

fn default_start_commit_index() -> u64 {
    1
}

fn default_poll_interval_ms() -> u64 {
    500
}
