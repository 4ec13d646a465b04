use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the mock agent fleet.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Fleet of gRPC reporting endpoints.
    #[serde(default)]
    pub grpc: GrpcConfig,

    /// Read-side HTTP API.
    #[serde(default)]
    pub api: ApiConfig,

    /// How long to wait for open streams on shutdown. Default: 5s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Fleet of gRPC reporting endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    /// Address of the first member. Members use consecutive ports.
    /// Default: "127.0.0.1:10091".
    #[serde(default = "default_grpc_listen")]
    pub listen: String,

    /// Number of members. Default: 20.
    #[serde(default = "default_grpc_count")]
    pub count: usize,
}

/// Read-side HTTP API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address. Default: "127.0.0.1:14000".
    #[serde(default = "default_api_listen")]
    pub listen: String,

    /// Answer CORS preflights for any origin. Default: true.
    #[serde(default = "default_true")]
    pub allow_all_origins: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_grpc_listen() -> String {
    "127.0.0.1:10091".to_string()
}

fn default_grpc_count() -> usize {
    20
}

fn default_api_listen() -> String {
    "127.0.0.1:14000".to_string()
}

fn default_true() -> bool {
    true
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            grpc: GrpcConfig::default(),
            api: ApiConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            listen: default_grpc_listen(),
            count: default_grpc_count(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
            allow_all_origins: default_true(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Self::parse_file(path)?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse a YAML file without validating, for callers that override
    /// fields before calling [`Config::validate`].
    pub fn parse_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.log_level.is_empty() {
            bail!("log_level is required");
        }

        self.grpc.member_addrs()?;
        self.api.addr()?;

        if self.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be positive");
        }

        Ok(())
    }
}

impl GrpcConfig {
    /// Address of the first fleet member.
    pub fn base_addr(&self) -> Result<SocketAddr> {
        parse_addr("grpc.listen", &self.listen)
    }

    /// Listen address of every member: the base address with ports
    /// `base, base + 1, ..., base + count - 1`.
    pub fn member_addrs(&self) -> Result<Vec<SocketAddr>> {
        let base = self.base_addr()?;

        if self.count == 0 {
            bail!("grpc.count must be positive");
        }

        if base.port() == 0 {
            bail!("grpc.listen port must be positive");
        }

        let last = usize::from(base.port()).checked_add(self.count - 1);
        if last.map_or(true, |last| last > usize::from(u16::MAX)) {
            bail!(
                "grpc.listen port {} with grpc.count {} exceeds port {}",
                base.port(),
                self.count,
                u16::MAX
            );
        }

        (0..self.count)
            .map(|i| {
                let port = u16::try_from(usize::from(base.port()) + i)
                    .context("member port out of range")?;
                Ok(SocketAddr::new(base.ip(), port))
            })
            .collect()
    }
}

impl ApiConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        parse_addr("api.listen", &self.listen)
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("{field} must be an ip:port address, got {value:?}"))
}
