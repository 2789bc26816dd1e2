use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::authority::DEFAULT_MAX_REDEEM_ATTEMPTS;
use crate::monitor::MonitorSettings;

const DEFAULT_DB_PATH: &str = "proctor.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8797";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30 * 60;

#[derive(Debug, Deserialize, Default)]
struct ProctorConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    monitor: Option<MonitorConfigFile>,
    recovery: Option<RecoveryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    poll_interval_secs: Option<u64>,
    lock_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecoveryConfigFile {
    max_redeem_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ProctorConfig {
    pub db_path: String,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Zero disables the lock timeout.
    pub lock_timeout: Duration,
    pub max_redeem_attempts: u32,
}

impl ProctorConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROCTOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ProctorConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .as_ref()
            .and_then(|api| api.addr.clone())
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let api_token_path = file.api.and_then(|api| api.token_path);
        let poll_interval = Duration::from_secs(
            file.monitor
                .as_ref()
                .and_then(|monitor| monitor.poll_interval_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );
        let lock_timeout = Duration::from_secs(
            file.monitor
                .and_then(|monitor| monitor.lock_timeout_secs)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
        );
        let max_redeem_attempts = file
            .recovery
            .and_then(|recovery| recovery.max_redeem_attempts)
            .unwrap_or(DEFAULT_MAX_REDEEM_ATTEMPTS);
        Self {
            db_path,
            api_addr,
            api_token_path,
            poll_interval,
            lock_timeout,
            max_redeem_attempts,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("PROCTOR_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("PROCTOR_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("PROCTOR_API_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.api_token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(secs) = std::env::var("PROCTOR_LOCK_TIMEOUT_SECS") {
            let seconds: u64 = secs.trim().parse().map_err(|_| {
                anyhow!("PROCTOR_LOCK_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.lock_timeout = Duration::from_secs(seconds);
        }
        if let Ok(attempts) = std::env::var("PROCTOR_MAX_REDEEM_ATTEMPTS") {
            self.max_redeem_attempts = attempts
                .trim()
                .parse()
                .map_err(|_| anyhow!("PROCTOR_MAX_REDEEM_ATTEMPTS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path cannot be empty"));
        }
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid api addr {}: {}", self.api_addr, e))?;
        if self.poll_interval.is_zero() {
            return Err(anyhow!("monitor poll interval must be greater than zero"));
        }
        if self.max_redeem_attempts == 0 {
            return Err(anyhow!("max_redeem_attempts must be greater than zero"));
        }
        Ok(())
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: self.poll_interval,
            lock_timeout: if self.lock_timeout.is_zero() {
                None
            } else {
                Some(self.lock_timeout)
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<ProctorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
