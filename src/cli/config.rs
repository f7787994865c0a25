// ABOUTME: Configuration management for the stepgraph application
// ABOUTME: Handles loading configuration from YAML files and merging environment overrides

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overrides every graph's own `max_number_jobs`.
    #[serde(default)]
    pub max_number_jobs: Option<usize>,

    /// Directory holding stored graphs and instance checkpoints.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Extra values merged into the context of every run.
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_number_jobs: None,
            state_dir: None,
            logging: LoggingConfig::default(),
            monitor: MonitorConfig::default(),
            context: Map::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let defaults = EngineOptions::default();
        Self {
            interval: defaults.monitor_interval,
            timeout: defaults.monitor_timeout,
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::find_config_file(),
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            serde_yaml::from_str(&contents).map_err(|e| {
                anyhow::anyhow!("Invalid configuration in {}: {}", config_path.display(), e)
            })?
        } else {
            Config::default()
        };

        config.merge_env()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> PathBuf {
        let local = [
            PathBuf::from("stepgraph.yaml"),
            PathBuf::from("stepgraph.yml"),
            PathBuf::from(".stepgraph.yaml"),
            PathBuf::from(".stepgraph.yml"),
        ];
        if let Some(path) = local.iter().find(|p| p.exists()) {
            return path.clone();
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".stepgraph").join("config.yaml");
            if home_config.exists() {
                return home_config;
            }
        }

        // May not exist; load falls back to defaults
        PathBuf::from("stepgraph.yaml")
    }

    /// Merge environment variables into configuration
    fn merge_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("STEPGRAPH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("STEPGRAPH_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(max_jobs) = std::env::var("STEPGRAPH_MAX_JOBS") {
            let max_jobs: usize = max_jobs
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid STEPGRAPH_MAX_JOBS '{}': {}", max_jobs, e))?;
            self.max_number_jobs = Some(max_jobs);
        }
        if let Ok(state_dir) = std::env::var("STEPGRAPH_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(state_dir));
        }
        Ok(())
    }

    /// Merge command line variables into the run context
    pub fn merge_context(&mut self, values: Map<String, Value>) {
        self.context.extend(values);
    }

    /// Configured state directory, or `~/.stepgraph/state`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(".stepgraph").join("state"))
            .unwrap_or_else(|| PathBuf::from(".stepgraph"))
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            monitor_interval: self.monitor.interval,
            monitor_timeout: self.monitor.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_number_jobs, None);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.monitor.interval, Duration::from_secs(1));
        assert_eq!(config.engine_options(), EngineOptions::default());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("stepgraph.yaml");
        fs::write(
            &config_path,
            r#"
max_number_jobs: 8
state_dir: /tmp/stepgraph-state
logging:
  level: debug
  format: compact
monitor:
  interval: 250ms
  timeout: 2m
context:
  sample: water
"#,
        )
        .unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "compact");
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/stepgraph-state"));
        assert_eq!(config.monitor.interval, Duration::from_millis(250));
        assert_eq!(config.monitor.timeout, Duration::from_secs(120));
        assert_eq!(config.context["sample"], Value::from("water"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config = Config::load(Some(temp_dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("stepgraph.yaml");
        fs::write(&config_path, "monitor:\n  interval: soon\n  timeout: 1s\n").unwrap();
        assert!(Config::load(Some(config_path)).is_err());
    }
}
