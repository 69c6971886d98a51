use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::flow::DEFAULT_SETTLE_DELAY;

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub default_interface: Option<String>,
    /// Delay applied on the specifier join path before the join is trusted
    /// to have completed. Policy knob, not a correctness guarantee.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    /// URL probed when NetworkManager cannot classify reachability itself.
    #[serde(default)]
    pub probe_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub ssid: String,
    pub passphrase: String,
    #[serde(default)]
    pub interface: Option<String>,
}

fn default_settle_delay_secs() -> u64 {
    DEFAULT_SETTLE_DELAY.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            networks: Vec::new(),
            default_interface: None,
            settle_delay_secs: default_settle_delay_secs(),
            probe_url: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn find_network(&self, ssid: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.ssid == ssid)
    }

    pub fn add_network(&mut self, network: NetworkConfig) {
        // Remove existing entry with same SSID
        self.networks.retain(|n| n.ssid != network.ssid);
        self.networks.push(network);
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?;
    Ok(config_dir.join("wifi-onboard").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settle_delay_matches_flow_constant() {
        let cfg = Config::default();
        assert_eq!(cfg.settle_delay(), DEFAULT_SETTLE_DELAY);
    }

    #[test]
    fn add_network_replaces_same_ssid() {
        let mut cfg = Config::default();
        cfg.add_network(NetworkConfig {
            ssid: "ESP32_Config".into(),
            passphrase: "12345678".into(),
            interface: None,
        });
        cfg.add_network(NetworkConfig {
            ssid: "ESP32_Config".into(),
            passphrase: "87654321".into(),
            interface: Some("wlan0".into()),
        });

        assert_eq!(cfg.networks.len(), 1);
        assert_eq!(cfg.networks[0].passphrase, "87654321");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [[networks]]
            ssid = "ESP32_Config"
            passphrase = "12345678"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.settle_delay_secs, 5);
        assert!(cfg.probe_url.is_none());
        assert!(cfg.networks[0].interface.is_none());
    }
}
