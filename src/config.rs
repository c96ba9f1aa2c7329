use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{vlog_debug, Error, Result};

/// A machine the controller can drive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineConfig {
    pub name: String,
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default = "default_product")]
    pub product: String,
    #[serde(default)]
    pub line_id: usize,
}

fn default_vendor() -> String {
    "Mitsubishi".to_string()
}

fn default_product() -> String {
    "RV-2F".to_string()
}

impl MachineConfig {
    pub fn simulated(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vendor: default_vendor(),
            product: default_product(),
            line_id: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Queue identifiers registered at startup.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Upper bound on concurrently running subtasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Rendezvous wait bound in seconds. Zero waits indefinitely.
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_secs: u64,
    /// ANSWER value that counts as operator approval.
    #[serde(default = "default_confirm_answer")]
    pub confirm_answer: String,
    #[serde(default = "default_machines")]
    pub machines: Vec<MachineConfig>,
    /// Finished operations the controller remembers.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_queues() -> Vec<String> {
    vec!["A".to_string(), "B".to_string(), "C".to_string()]
}

fn default_max_workers() -> usize {
    8
}

fn default_decision_timeout() -> u64 {
    300
}

fn default_confirm_answer() -> String {
    "YES".to_string()
}

fn default_history_limit() -> usize {
    1000
}

fn default_machines() -> Vec<MachineConfig> {
    vec![MachineConfig::simulated("rv2f-sim")]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            max_workers: default_max_workers(),
            decision_timeout_secs: default_decision_timeout(),
            confirm_answer: default_confirm_answer(),
            machines: default_machines(),
            history_limit: default_history_limit(),
        }
    }
}

impl Config {
    pub fn vrobot_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".vrobot"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::vrobot_dir()?.join("vrobot.toml"))
    }

    pub fn decision_timeout(&self) -> Option<Duration> {
        match self.decision_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        vlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            vlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        vlog_debug!(
            "Config loaded: queues={:?}, max_workers={}, decision_timeout_secs={}, machines={}",
            config.queues,
            config.max_workers,
            config.decision_timeout_secs,
            config.machines.len()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        vlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::vrobot_dir()?;
        if !dir.exists() {
            vlog_debug!("Creating vrobot directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Validation("max_workers must be at least 1".into()));
        }
        if self.history_limit == 0 {
            return Err(Error::Validation("history_limit must be at least 1".into()));
        }
        if self.queues.is_empty() {
            return Err(Error::Validation("at least one queue is required".into()));
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.trim().is_empty() {
                return Err(Error::Validation("queue names must not be empty".into()));
            }
            if !seen.insert(queue.as_str()) {
                return Err(Error::Validation(format!("duplicate queue: {}", queue)));
            }
        }
        let mut seen = HashSet::new();
        for machine in &self.machines {
            if !seen.insert(machine.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate machine: {}",
                    machine.name
                )));
            }
        }
        Ok(())
    }
}
