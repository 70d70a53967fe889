//! VirtHID daemon configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use libvirthid::NotifyThrottle;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VirtHidConfig {
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Pause after each delivered report; 0 disables
    #[serde(default = "default_throttle")]
    pub throttle_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { throttle_ms: default_throttle() }
    }
}

impl NotifyConfig {
    pub fn throttle(&self) -> NotifyThrottle {
        NotifyThrottle::new(Duration::from_millis(self.throttle_ms))
    }
}

fn default_throttle() -> u64 { 1 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "default_max_descriptor_len")]
    pub max_descriptor_len: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_devices: default_max_devices(),
            max_descriptor_len: default_max_descriptor_len(),
        }
    }
}

fn default_max_devices() -> usize { 64 }
fn default_max_descriptor_len() -> usize { 4096 }

pub fn load_config(path: &Path) -> Result<VirtHidConfig> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    } else {
        Ok(VirtHidConfig::default())
    }
}
