use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_disk_path")]
    pub disk_path: String,
    #[serde(default = "default_net_interface")]
    pub net_interface: String,
    #[serde(default)]
    pub probes: ProbesConfig,
}

/// Where each probe reads from. Paths and tool names differ between distributions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbesConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_sensors_command")]
    pub sensors_command: String,
    #[serde(default = "default_gpu_command")]
    pub gpu_command: String,
    #[serde(default = "default_cuda_library")]
    pub cuda_library: String,
    #[serde(default = "default_cpuinfo_path")]
    pub cpuinfo_path: String,
    #[serde(default = "default_package_temp_path")]
    pub package_temp_path: String,
    #[serde(default = "default_diskstats_path")]
    pub diskstats_path: String,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            sensors_command: default_sensors_command(),
            gpu_command: default_gpu_command(),
            cuda_library: default_cuda_library(),
            cpuinfo_path: default_cpuinfo_path(),
            package_temp_path: default_package_temp_path(),
            diskstats_path: default_diskstats_path(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if !Path::new(&self.disk_path).is_absolute() {
            return Err(ConfigError::Validation(format!(
                "disk_path '{}' must be an absolute path",
                self.disk_path
            )));
        }
        if self.net_interface.trim().is_empty() {
            return Err(ConfigError::Validation(
                "net_interface must not be empty".to_string(),
            ));
        }

        validate_probes(&self.probes)?;

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl ProbesConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn validate_probes(cfg: &ProbesConfig) -> Result<(), ConfigError> {
    if cfg.command_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "probes.command_timeout_ms must be > 0".to_string(),
        ));
    }

    let required = [
        ("sensors_command", &cfg.sensors_command),
        ("gpu_command", &cfg.gpu_command),
        ("cuda_library", &cfg.cuda_library),
        ("cpuinfo_path", &cfg.cpuinfo_path),
        ("package_temp_path", &cfg.package_temp_path),
        ("diskstats_path", &cfg.diskstats_path),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "probes.{name} must not be empty"
            )));
        }
    }

    Ok(())
}

const fn default_interval_secs() -> u64 {
    1
}

fn default_disk_path() -> String {
    "/home".to_string()
}

fn default_net_interface() -> String {
    "eno1".to_string()
}

const fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_sensors_command() -> String {
    "sensors".to_string()
}

fn default_gpu_command() -> String {
    "nvidia-smi".to_string()
}

fn default_cuda_library() -> String {
    "libcudart.so".to_string()
}

fn default_cpuinfo_path() -> String {
    "/proc/cpuinfo".to_string()
}

fn default_package_temp_path() -> String {
    "/sys/class/thermal/thermal_zone0/temp".to_string()
}

fn default_diskstats_path() -> String {
    "/proc/diskstats".to_string()
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        listen: "127.0.0.1:9109".to_string(),
        interval_secs: 1,
        disk_path: default_disk_path(),
        net_interface: default_net_interface(),
        probes: ProbesConfig::default(),
    }
}
