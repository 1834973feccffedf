//! Layered configuration: CLI flags override environment variables override
//! an optional TOML file override built-in defaults.
//!
//! Grounded on `mem_etcd::main`'s `clap::Parser` struct with `env = "..."`
//! attributes; extended with a TOML file layer the way `spark2026` and
//! `Alb-O-xeno` both load workspace config (both depend on `toml`).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "txstream-broker", about = "Pub/sub fan-out broker for a blockchain transaction stream")]
pub struct Cli {
    /// Path to a TOML config file; CLI flags and env vars still take
    /// precedence over anything it sets.
    #[arg(long, env = "BROKER_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "BROKER_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "BROKER_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "BROKER_TTL")]
    pub ttl: Option<i64>,

    #[arg(long, env = "BROKER_TTL_TOLERANCE")]
    pub ttl_tolerance: Option<i64>,

    #[arg(long, env = "BROKER_ENABLE_HEAD")]
    pub enable_head: Option<bool>,

    #[arg(long, env = "BROKER_ENABLE_IRREVERSIBLE")]
    pub enable_irreversible: Option<bool>,

    #[arg(long, env = "BROKER_NODE_URL")]
    pub node_url: Option<String>,

    #[arg(long, env = "BROKER_NODE_POLL_INTERVAL_MS")]
    pub node_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    proxy_settings: ProxySettingsFile,
    #[serde(default)]
    node_settings: NodeSettingsFile,
}

#[derive(Debug, Default, Deserialize)]
struct ProxySettingsFile {
    port: Option<u16>,
    metrics_port: Option<u16>,
    ttl: Option<i64>,
    ttl_tolerance: Option<i64>,
    enable_head: Option<bool>,
    enable_irreversible: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSettingsFile {
    url: Option<String>,
    poll_interval_ms: Option<u64>,
}

/// Fully resolved proxy settings, corresponding to spec's `[proxy_settings]`.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub port: u16,
    pub metrics_port: u16,
    pub ttl: i64,
    pub ttl_tolerance: i64,
    pub enable_head: bool,
    pub enable_irreversible: bool,
}

/// Fully resolved upstream node settings, corresponding to spec's
/// `[node_settings]` (renamed from the original `STEEM_SETTINGS`: the
/// upstream driver here is generic, not tied to any one chain).
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub url: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub proxy: ProxySettings,
    pub node: NodeSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

impl Config {
    /// Resolve layered config: CLI > env (already folded into `cli` by
    /// clap's `env` attribute) > file > default.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str::<FileConfig>(&text).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => FileConfig::default(),
        };

        let proxy = ProxySettings {
            port: cli.port.or(file.proxy_settings.port).unwrap_or(9090),
            metrics_port: cli
                .metrics_port
                .or(file.proxy_settings.metrics_port)
                .unwrap_or(9091),
            ttl: cli.ttl.or(file.proxy_settings.ttl).unwrap_or(30),
            ttl_tolerance: cli
                .ttl_tolerance
                .or(file.proxy_settings.ttl_tolerance)
                .unwrap_or(5),
            enable_head: cli
                .enable_head
                .or(file.proxy_settings.enable_head)
                .unwrap_or(true),
            enable_irreversible: cli
                .enable_irreversible
                .or(file.proxy_settings.enable_irreversible)
                .unwrap_or(true),
        };

        let node = NodeSettings {
            url: cli
                .node_url
                .or(file.node_settings.url)
                .ok_or(ConfigError::Missing("node_settings.url"))?,
            poll_interval_ms: cli
                .node_poll_interval_ms
                .or(file.node_settings.poll_interval_ms)
                .unwrap_or(3000),
        };

        Ok(Config { proxy, node })
    }
}
