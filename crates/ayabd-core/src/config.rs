//! Daemon configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default control API port
pub const DEFAULT_API_PORT: u16 = 9999;

/// Default connection: the first USB CDC device, where an Arduino usually shows up
pub const DEFAULT_CONNECTION: &str = "/dev/ttyACM0";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings of the knitting service, loaded from JSON and overridden on the command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// `simulation`, a serial device path, or `host[:port]`
    pub connection: String,

    /// Directory holding the queue state file
    pub state_dir: PathBuf,

    /// TCP port of the control API
    pub api_port: u16,

    /// Accept API connections from other hosts
    pub api_non_local: bool,

    /// Delay before a failed job is started again
    pub job_retry_delay_ms: u64,

    /// Delay between opening the connection and the first job start,
    /// so the controller can finish booting
    pub startup_delay_ms: u64,

    /// Interval between connection attempts
    pub reconnect_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            connection: DEFAULT_CONNECTION.to_string(),
            state_dir: default_state_dir(),
            api_port: DEFAULT_API_PORT,
            api_non_local: false,
            job_retry_delay_ms: 3000,
            startup_delay_ms: 3000,
            reconnect_delay_ms: 5000,
        }
    }
}

/// `<data dir>/ayabd`, or the working directory if the platform has none
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("ayabd"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn job_retry_delay(&self) -> Duration {
        Duration::from_millis(self.job_retry_delay_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
