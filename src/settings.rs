use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_origin_port() -> u16 {
    443
}

fn default_origin_tls() -> bool {
    true
}

fn default_client_timeout() -> u64 {
    30
}

fn default_origin_connect_timeout() -> u64 {
    5
}

fn default_origin_timeout() -> u64 {
    60
}

fn default_tls_handshake_timeout() -> u64 {
    10
}

fn default_origin_pool_capacity() -> usize {
    8
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_max_entry_size() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_total_capacity() -> u64 {
    4 * 1024 * 1024 * 1024 // 4 GiB
}

fn default_cache_sweeper_interval() -> u64 {
    300
}

fn default_cache_sweeper_batch_size() -> usize {
    1000
}

fn default_cache_stale_grace() -> u64 {
    7 * 86_400
}

/// Runtime configuration for one mirror instance. Each instance fronts a
/// single origin host and owns a single cache directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Remote origin host this instance mirrors.
    pub origin_host: String,
    #[serde(default = "default_origin_port")]
    pub origin_port: u16,
    /// Plaintext origins are only useful for test deployments.
    #[serde(default = "default_origin_tls")]
    pub origin_tls: bool,
    /// Cache directory. Must already exist; only the layout inside it is managed.
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub listen_tcp: Option<SocketAddr>,
    #[serde(default)]
    pub listen_unix: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Replaces the client User-Agent on origin requests when set.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout: u64,
    #[serde(default = "default_origin_pool_capacity")]
    pub origin_pool_capacity: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_cache_max_entry_size")]
    pub cache_max_entry_size: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_total_capacity")]
    pub cache_total_capacity: u64,
    #[serde(default = "default_cache_sweeper_interval")]
    pub cache_sweeper_interval: u64,
    #[serde(default = "default_cache_sweeper_batch_size")]
    pub cache_sweeper_batch_size: usize,
    /// Stale entries older than freshness + grace are removed by the sweeper.
    #[serde(default = "default_cache_stale_grace")]
    pub cache_stale_grace: u64,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("LOCALMIRROR")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout)
    }

    pub fn cache_sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweeper_interval)
    }

    pub fn cache_stale_grace(&self) -> Duration {
        Duration::from_secs(self.cache_stale_grace)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_dir = absolutize(&self.cache_dir, base_dir);
        self.listen_unix = self
            .listen_unix
            .as_ref()
            .map(|path| absolutize(path, base_dir));
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.origin_host.is_empty(), "origin_host must not be empty");
        ensure!(
            self.origin_host
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-'),
            "origin_host '{}' contains invalid characters",
            self.origin_host
        );
        match (&self.listen_tcp, &self.listen_unix) {
            (Some(_), Some(_)) => {
                bail!("listen_tcp and listen_unix are mutually exclusive")
            }
            (None, None) => bail!("one of listen_tcp or listen_unix must be set"),
            _ => {}
        }
        ensure!(
            self.cache_dir.is_dir(),
            "cache_dir {} does not exist or is not a directory",
            self.cache_dir.display()
        );
        ensure!(
            self.origin_pool_capacity > 0,
            "origin_pool_capacity must be at least 1 (got {})",
            self.origin_pool_capacity
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.cache_max_entry_size > 0,
            "cache_max_entry_size must be greater than 0 (got {})",
            self.cache_max_entry_size
        );
        ensure!(
            self.cache_max_entries > 0,
            "cache_max_entries must be greater than 0 (got {})",
            self.cache_max_entries
        );
        ensure!(
            self.cache_total_capacity > 0,
            "cache_total_capacity must be greater than 0 (got {})",
            self.cache_total_capacity
        );
        Ok(())
    }
}

#[cfg(test)]
impl Settings {
    /// Baseline settings for unit tests. Fields are public so tests adjust
    /// what they exercise.
    pub(crate) fn for_tests() -> Self {
        Settings {
            origin_host: "mirror.example.com".to_string(),
            origin_port: 443,
            origin_tls: true,
            cache_dir: std::env::temp_dir(),
            listen_tcp: Some("127.0.0.1:0".parse().unwrap()),
            listen_unix: None,
            log: LogFormat::Text,
            user_agent: None,
            client_timeout: 5,
            origin_connect_timeout: 2,
            origin_timeout: 5,
            tls_handshake_timeout: 2,
            origin_pool_capacity: 8,
            max_header_size: 32 * 1024,
            max_response_header_size: 32 * 1024,
            max_request_body_size: 1024 * 1024,
            cache_max_entry_size: 1024 * 1024,
            cache_max_entries: 128,
            cache_total_capacity: 16 * 1024 * 1024,
            cache_sweeper_interval: 300,
            cache_sweeper_batch_size: 100,
            cache_stale_grace: 3600,
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/localmirror/localmirror.toml"),
        PathBuf::from("localmirror.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
