//! Read-only configuration snapshot consumed by the core.
//!
//! Supplied by the settings store as JSON. Missing fields fall back to
//! defaults so a partial file is valid.

use crate::error::ConfigError;
use crate::types::SubsystemKind;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "control-panel";
const CONFIG_FILE: &str = "core.json";

/// Per-subsystem settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemConfig {
    pub enabled: bool,
    /// Overrides the default poll interval for this kind.
    pub poll_interval_ms: Option<u64>,
}

impl Default for SubsystemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Scheduler tick.
    pub tick_ms: u64,
    /// Slow re-probe cadence of the capability registry.
    pub reprobe_secs: u64,
    pub probe_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub apply_timeout_ms: u64,
    /// Retries of a transient apply failure. At most 1 is honoured.
    pub apply_retries: u32,
    pub retry_backoff_ms: u64,
    pub subsystems: HashMap<SubsystemKind, SubsystemConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            reprobe_secs: 30,
            probe_timeout_ms: 2000,
            poll_timeout_ms: 2000,
            apply_timeout_ms: 5000,
            apply_retries: 1,
            retry_backoff_ms: 250,
            subsystems: HashMap::new(),
        }
    }
}

impl CoreConfig {
    /// `$XDG_CONFIG_HOME/control-panel/core.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load from config file, or return defaults if it is missing or broken.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::NotFound(p)) => {
                debug!("No config at {}, using defaults", p.display());
                Self::default()
            }
            Err(e) => {
                warn!("Ignoring config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn subsystem(&self, kind: SubsystemKind) -> SubsystemConfig {
        self.subsystems.get(&kind).cloned().unwrap_or_default()
    }

    pub fn is_enabled(&self, kind: SubsystemKind) -> bool {
        self.subsystem(kind).enabled
    }

    pub fn poll_interval(&self, kind: SubsystemKind) -> Duration {
        let ms = self
            .subsystem(kind)
            .poll_interval_ms
            .unwrap_or_else(|| default_poll_interval_ms(kind));
        Duration::from_millis(ms.max(1))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn reprobe_interval(&self) -> Duration {
        Duration::from_secs(self.reprobe_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Retry count clamped so a command is never re-sent more than once.
    pub fn effective_retries(&self) -> u32 {
        self.apply_retries.min(1)
    }
}

/// Battery percentage moves far slower than audio device lists.
fn default_poll_interval_ms(kind: SubsystemKind) -> u64 {
    match kind {
        SubsystemKind::Network => 5_000,
        SubsystemKind::Bluetooth => 5_000,
        SubsystemKind::Audio => 1_000,
        SubsystemKind::Brightness => 1_000,
        SubsystemKind::Power => 30_000,
        SubsystemKind::BlueLight => 5_000,
    }
}
