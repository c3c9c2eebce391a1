use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "least-conn-mtls-forwarder", version, about = "mTLS least-connections TCP forwarder")]
pub struct Cli {
    #[arg(long, default_value = "forwarder.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub listen: String,
    pub tls: TlsConfig,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_quarantine_window_secs")]
    pub quarantine_window_secs: u64,

    #[serde(default)]
    pub limiter: LimiterConfig,

    pub upstreams: Vec<String>,

    #[serde(default)]
    pub clients: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub ca_file: String,
    pub server_cert: String,
    pub server_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimiterConfig {
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_rate")]
    pub rate: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            burst: default_burst(),
            rate: default_rate(),
        }
    }
}

fn default_burst() -> u32 {
    3
}

fn default_rate() -> f64 {
    1.0
}

fn default_dial_timeout_ms() -> u64 {
    2_000
}

fn default_quarantine_window_secs() -> u64 {
    30
}

impl Config {
    /// Every upstream named in a client's allow-list must also appear
    /// in the top-level upstream list; a dangling name here is a
    /// configuration error, not a runtime filter case.
    fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            bail!("config must list at least one upstream");
        }
        let known: std::collections::HashSet<&str> =
            self.upstreams.iter().map(String::as_str).collect();
        for (client, allowed) in &self.clients {
            for upstream in allowed {
                if !known.contains(upstream.as_str()) {
                    bail!("client '{client}' allow-list names unknown upstream '{upstream}'");
                }
            }
        }
        if self.limiter.burst == 0 {
            bail!("limiter burst must be positive");
        }
        if self.limiter.rate <= 0.0 {
            bail!("limiter rate must be positive");
        }
        Ok(())
    }
}

pub fn load_config() -> Result<(Cli, Config)> {
    let cli = Cli::parse();

    let yaml = fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;

    let cfg: Config = serde_yaml::from_str(&yaml)
        .with_context(|| format!("failed to parse YAML in {}", cli.config.display()))?;

    cfg.validate().context("invalid configuration")?;

    Ok((cli, cfg))
}
