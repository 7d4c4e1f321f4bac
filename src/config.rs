// src/config.rs

//! Daemon configuration: loading, defaults, and validation.

use crate::core::rules::{ConciliationStrategy, StartStrategy};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// One declared node of the fleet.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    /// Canonical name, unique across the fleet.
    pub name: String,
    /// Literals that also resolve to this node (FQDN, IPv4).
    #[serde(default)]
    pub aliases: Vec<String>,
    /// `host:port` of the node's local supervisor endpoint.
    pub supervisor: String,
}

/// Options retained for the external statistics collector.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatsConfig {
    /// Sampling periods in seconds, each a multiple of 5 within 5..=3600.
    #[serde(default = "default_stats_periods")]
    pub periods: Vec<u64>,
    /// Depth of the value history, 10..=1500.
    #[serde(default = "default_stats_histo")]
    pub histo: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            periods: default_stats_periods(),
            histo: default_stats_histo(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Canonical name of this node; must appear in `nodes`.
    pub node_name: String,
    pub nodes: Vec<NodeConfig>,
    /// No tick within this window moves a node to SILENT.
    #[serde(with = "humantime_serde", default = "default_synchro_timeout")]
    pub synchro_timeout: Duration,
    /// Pub/sub event stream port.
    #[serde(default = "default_event_port")]
    pub event_port: u16,
    /// Request/reply RPC port.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Port peers and the local supervisor push ticks and events to.
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,
    /// Path of the TOML rules file; absent means default rules everywhere.
    #[serde(default)]
    pub rules_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// A node refused by the authorization handshake stays excluded.
    #[serde(default)]
    pub auto_fence: bool,
    #[serde(default)]
    pub deployment_strategy: StartStrategy,
    #[serde(default)]
    pub conciliation_strategy: ConciliationStrategy,
    #[serde(default)]
    pub stats: StatsConfig,
}

fn default_synchro_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_event_port() -> u16 {
    60002
}
fn default_rpc_port() -> u16 {
    60000
}
fn default_internal_port() -> u16 {
    60001
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_stats_periods() -> Vec<u64> {
    vec![10]
}
fn default_stats_histo() -> usize {
    200
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(anyhow!("at least one node must be declared"));
        }
        if !self.nodes.iter().any(|n| n.name == self.node_name) {
            return Err(anyhow!(
                "node_name '{}' is not in the declared node list",
                self.node_name
            ));
        }
        let timeout = self.synchro_timeout.as_secs();
        if !(15..=1200).contains(&timeout) {
            return Err(anyhow!(
                "synchro_timeout must be within 15s..=1200s, got {}s",
                timeout
            ));
        }
        for period in &self.stats.periods {
            if !(5..=3600).contains(period) || period % 5 != 0 {
                return Err(anyhow!(
                    "stats period {} must be a multiple of 5 within 5..=3600",
                    period
                ));
            }
        }
        if !(10..=1500).contains(&self.stats.histo) {
            return Err(anyhow!(
                "stats histo depth must be within 10..=1500, got {}",
                self.stats.histo
            ));
        }
        Ok(())
    }
}
