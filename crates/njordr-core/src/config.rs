//! Configuration structures for njordr

use crate::message::Serializer;
use crate::tls::TlsConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the directory that holds `config.toml`
pub const CONFIG_DIR_ENV: &str = "SERVICE_CONFIG_DIR";

/// Main configuration for njordr
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NjordrConfig {
    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Service (worker) configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NjordrConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::Error::Configuration(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Locate the config file: explicit path first, then `$SERVICE_CONFIG_DIR/config.toml`
    pub fn resolve_path(path: Option<impl AsRef<Path>>) -> Option<PathBuf> {
        match path {
            Some(p) => Some(p.as_ref().to_path_buf()),
            None => std::env::var_os(CONFIG_DIR_ENV).map(|dir| PathBuf::from(dir).join("config.toml")),
        }
    }

    /// Apply `NJORDR_*` environment overrides
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(host) = std::env::var("NJORDR_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = std::env::var("NJORDR_BROKER_PORT") {
            self.broker.port = parse_env("NJORDR_BROKER_PORT", &port)?;
        }
        if let Ok(capacity) = std::env::var("NJORDR_QUEUE_CAPACITY") {
            self.broker.queue_capacity = parse_env("NJORDR_QUEUE_CAPACITY", &capacity)?;
        }
        if let Ok(limit) = std::env::var("NJORDR_RETRY_LIMIT") {
            self.broker.retry_limit = parse_env("NJORDR_RETRY_LIMIT", &limit)?;
        }
        if let Ok(addr) = std::env::var("NJORDR_BROKER_ADDR") {
            self.service.broker_addr = addr;
        }
        if let Ok(id) = std::env::var("NJORDR_WORKER_ID") {
            self.service.id = Some(id);
        }
        Ok(())
    }

    /// Load from file (if any), then apply environment overrides
    pub fn load(path: Option<impl AsRef<Path>>) -> crate::Result<Self> {
        let mut config = match Self::resolve_path(path) {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Reject settings the broker and service cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let broker = &self.broker;
        if broker.queue_capacity == 0 {
            return Err(invalid("broker.queue_capacity must be at least 1"));
        }
        if broker.retry_limit == 0 {
            return Err(invalid("broker.retry_limit must be at least 1"));
        }
        if broker.heartbeat_timeout_ms == 0 || broker.dead_grace_ms == 0 {
            return Err(invalid("broker heartbeat timeout and dead grace must be non-zero"));
        }
        if broker.sweep_interval_ms == 0 || broker.dispatch_interval_ms == 0 {
            return Err(invalid("broker sweep and dispatch intervals must be non-zero"));
        }
        if self.service.heartbeat_interval_ms == 0 {
            return Err(invalid("service.heartbeat_interval_ms must be non-zero"));
        }
        if self.service.heartbeat_interval_ms >= broker.heartbeat_timeout_ms {
            return Err(invalid(
                "service.heartbeat_interval_ms must be shorter than broker.heartbeat_timeout_ms",
            ));
        }
        if self.service.concurrency == 0 {
            return Err(invalid("service.concurrency must be at least 1"));
        }
        broker.tls.validate()?;
        self.service.tls.validate()?;
        Ok(())
    }
}

fn invalid(message: &str) -> crate::Error {
    crate::Error::Configuration(message.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Configuration(format!("Invalid value for {}: {}", name, value)))
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Transport port for workers and producers
    #[serde(default = "default_port")]
    pub port: u16,

    /// Admin HTTP API port
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Enable the admin HTTP API
    #[serde(default = "default_true")]
    pub enable_admin: bool,

    /// Maximum number of pending items
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Failed attempts after which an item is failed permanently
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Heartbeat age after which a worker is suspected
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Additional time a suspected worker gets before it is declared dead
    #[serde(default = "default_dead_grace_ms")]
    pub dead_grace_ms: u64,

    /// Liveness sweep period
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Dispatch loop period when nothing wakes it earlier
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Terminal items kept for status queries
    #[serde(default = "default_finished_retention")]
    pub finished_retention: usize,

    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Body encoding for frames the broker sends
    #[serde(default)]
    pub serializer: Serializer,

    /// Mutual TLS on the transport listener
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7400
}

fn default_admin_port() -> u16 {
    7401
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_retry_limit() -> u32 {
    3
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_dead_grace_ms() -> u64 {
    15_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_dispatch_interval_ms() -> u64 {
    250
}

fn default_finished_retention() -> usize {
    10_000
}

fn default_max_frame_size() -> usize {
    crate::frame::DEFAULT_MAX_FRAME_SIZE
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_port: default_admin_port(),
            enable_admin: default_true(),
            queue_capacity: default_queue_capacity(),
            retry_limit: default_retry_limit(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            dead_grace_ms: default_dead_grace_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            finished_retention: default_finished_retention(),
            max_frame_size: default_max_frame_size(),
            serializer: Serializer::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Get the transport address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the admin API address
    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.host, self.admin_port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn dead_grace(&self) -> Duration {
        Duration::from_millis(self.dead_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

/// Service (worker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Worker ID (auto-generated if not specified)
    pub id: Option<String>,

    /// Hostname
    pub hostname: Option<String>,

    /// Broker transport address
    #[serde(default = "default_broker_addr")]
    pub broker_addr: String,

    /// Worker identities run by one process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Heartbeat interval
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Connection attempts before giving up at startup
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// First reconnect delay; doubles on each failure
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// Reconnect delay cap
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Hard limit for one job execution in seconds
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Body encoding for frames the service sends
    #[serde(default)]
    pub serializer: Serializer,

    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Mutual TLS towards the broker
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_broker_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_shutdown_timeout_secs() -> u64 {
    60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: None,
            hostname: None,
            broker_addr: default_broker_addr(),
            concurrency: default_concurrency(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            serializer: Serializer::default(),
            max_frame_size: default_max_frame_size(),
            tls: TlsConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Get the worker ID, generating one if not set
    pub fn get_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            let hostname = self.get_hostname();
            let pid = std::process::id();
            format!("{}@{}", hostname, pid)
        })
    }

    /// Get the hostname
    pub fn get_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    /// Worker ids for all identities this process runs
    ///
    /// A single identity uses the id as is; with `concurrency` above one
    /// every identity gets an `<id>-<n>` suffix.
    pub fn identity_ids(&self) -> Vec<String> {
        let base = self.get_id();
        let count = self.concurrency.max(1);
        if count == 1 {
            return vec![base];
        }
        (0..count).map(|n| format!("{}-{}", base, n)).collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Delay before the given (zero-based) reconnect attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2_u64.saturating_pow(attempt);
        let delay = self.connect_backoff_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable)
    Json,
    /// Pretty format (human-readable, colored)
    #[default]
    Pretty,
    /// Compact format (single line)
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" | "text" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include file/line information
    #[serde(default = "default_true")]
    pub include_location: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub include_target: bool,

    /// Environment filter string (e.g., "njordr_broker=debug,tower_http=warn")
    pub env_filter: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            include_location: default_true(),
            include_target: default_true(),
            env_filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NjordrConfig::default();
        assert_eq!(config.broker.port, 7400);
        assert_eq!(config.broker.retry_limit, 3);
        assert_eq!(config.service.broker_addr, "127.0.0.1:7400");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_id_generation() {
        let config = ServiceConfig::default();
        let id = config.get_id();
        assert!(id.contains('@'));

        let config = ServiceConfig {
            id: Some("svc-a".into()),
            ..Default::default()
        };
        assert_eq!(config.get_id(), "svc-a");
    }

    #[test]
    fn test_identity_ids() {
        let config = ServiceConfig {
            id: Some("svc".into()),
            ..Default::default()
        };
        assert_eq!(config.identity_ids(), vec!["svc"]);

        let config = ServiceConfig {
            id: Some("svc".into()),
            concurrency: 3,
            ..Default::default()
        };
        assert_eq!(config.identity_ids(), vec!["svc-0", "svc-1", "svc-2"]);
    }

    #[test]
    fn test_tls_section() {
        let config: NjordrConfig = toml::from_str(
            r#"
            [broker.tls]
            enabled = true
            ca = "/nonexistent/ca.pem"
            cert = "/nonexistent/broker.pem"
            key = "/nonexistent/broker.key"
            "#,
        )
        .unwrap();

        assert!(config.broker.tls.enabled);
        assert!(!config.service.tls.enabled);
        assert!(matches!(config.validate(), Err(crate::Error::Tls(_))));
    }

    #[test]
    fn test_broker_addresses() {
        let config = BrokerConfig::default();
        assert_eq!(config.addr(), "0.0.0.0:7400");
        assert_eq!(config.admin_addr(), "0.0.0.0:7401");
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = ServiceConfig {
            connect_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(4), Duration::from_millis(1_000));
        assert_eq!(config.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: NjordrConfig = toml::from_str(
            r#"
            [broker]
            port = 9000
            retry_limit = 2
            serializer = "json"

            [service]
            id = "svc-1"
            heartbeat_interval_ms = 100

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.port, 9000);
        assert_eq!(config.broker.retry_limit, 2);
        assert_eq!(config.broker.serializer, Serializer::Json);
        assert_eq!(config.broker.queue_capacity, 10_000);
        assert_eq!(config.service.get_id(), "svc-1");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[broker]\nqueue_capacity = 5\n").unwrap();

        let config = NjordrConfig::from_file(&path).unwrap();
        assert_eq!(config.broker.queue_capacity, 5);

        let missing = NjordrConfig::from_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(crate::Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NjordrConfig::default();
        config.broker.retry_limit = 0;
        assert!(config.validate().is_err());

        let mut config = NjordrConfig::default();
        config.service.heartbeat_interval_ms = config.broker.heartbeat_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = NjordrConfig::default();
        config.broker.queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
