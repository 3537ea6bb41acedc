//! Harness configuration.
//!
//! Defaults are tuned for a developer laptop running a handful of meshes in
//! parallel. Everything can be overridden from the environment or a YAML
//! file, which is how CI points the harness at a freshly built daemon.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the daemon executable.
pub const ENV_DAEMON_BIN: &str = "MESH_DAEMON_BIN";
/// Environment variable overriding the base directory for test meshes.
pub const ENV_BASE_DIR: &str = "MESH_HARNESS_BASE_DIR";
/// Environment variable pointing at a YAML harness config file.
pub const ENV_CONFIG_FILE: &str = "MESH_HARNESS_CONFIG";

/// Upper bound on any ready-wait poll interval.
pub const MAX_READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration shared by every mesh a test starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Daemon executable used by the out-of-process launcher
    pub daemon_bin: Option<PathBuf>,
    /// Flag passing the generated config path to the daemon
    pub config_flag: String,
    /// Directory under which each mesh allocates a unique subdirectory
    pub base_dir: PathBuf,
    /// Log level written into every node's config
    pub node_log_level: String,
    /// Interval between convergence checks during ready-wait
    #[serde(with = "humantime_serde")]
    pub ready_poll_interval: Duration,
    /// Interval between work status queries
    #[serde(with = "humantime_serde")]
    pub work_poll_interval: Duration,
    /// Interval between socket-table scans during shutdown-wait
    #[serde(with = "humantime_serde")]
    pub shutdown_poll_interval: Duration,
    /// How long shutdown-wait tolerates lingering processes or sockets
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(with = "humantime_serde")]
    pub termination_grace: Duration,
    /// Per-request timeout on control sockets
    #[serde(with = "humantime_serde")]
    pub protocol_timeout: Duration,
    /// How long a launcher waits for a node's control socket to appear
    #[serde(with = "humantime_serde")]
    pub socket_appear_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            daemon_bin: None,
            config_flag: "--config".to_string(),
            base_dir: std::env::temp_dir().join("mesh-harness"),
            node_log_level: "info".to_string(),
            ready_poll_interval: Duration::from_millis(100),
            work_poll_interval: Duration::from_millis(250),
            shutdown_poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(10),
            termination_grace: Duration::from_secs(2),
            protocol_timeout: Duration::from_secs(10),
            socket_appear_timeout: Duration::from_secs(10),
        }
    }
}

impl HarnessConfig {
    /// Load configuration: file named by `MESH_HARNESS_CONFIG` (if any),
    /// then `MESH_DAEMON_BIN` / `MESH_HARNESS_BASE_DIR` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(ENV_CONFIG_FILE) {
            Some(path) => Self::from_yaml_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(bin) = std::env::var_os(ENV_DAEMON_BIN) {
            if !bin.is_empty() {
                config.daemon_bin = Some(PathBuf::from(bin));
            }
        }
        if let Some(dir) = std::env::var_os(ENV_BASE_DIR) {
            if !dir.is_empty() {
                config.base_dir = PathBuf::from(dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file; missing keys take defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make waits unbounded or nonsensical.
    pub fn validate(&self) -> Result<()> {
        if self.ready_poll_interval.is_zero() || self.ready_poll_interval > MAX_READY_POLL_INTERVAL
        {
            return Err(HarnessError::Config(format!(
                "ready_poll_interval must be within (0, {MAX_READY_POLL_INTERVAL:?}], got {:?}",
                self.ready_poll_interval
            )));
        }
        for (name, value) in [
            ("work_poll_interval", self.work_poll_interval),
            ("shutdown_poll_interval", self.shutdown_poll_interval),
            ("shutdown_timeout", self.shutdown_timeout),
            ("protocol_timeout", self.protocol_timeout),
            ("socket_appear_timeout", self.socket_appear_timeout),
        ] {
            if value.is_zero() {
                return Err(HarnessError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.config_flag.trim().is_empty() {
            return Err(HarnessError::Config("config_flag must not be empty".into()));
        }
        Ok(())
    }

    /// Daemon executable, or a config error naming the variable to set.
    pub fn require_daemon_bin(&self) -> Result<&Path> {
        self.daemon_bin.as_deref().ok_or_else(|| {
            HarnessError::Config(format!(
                "no daemon executable configured; set {ENV_DAEMON_BIN}"
            ))
        })
    }
}
