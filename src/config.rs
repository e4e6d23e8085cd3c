use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Runtime settings for the serve surface. File values can be overridden
/// through `FLOWBENCH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    /// Port the request engine listens on.
    pub port: u16,
    /// Directory scanned for flow definition files.
    pub flows_dir: PathBuf,
    /// Where rolling log files go; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    /// Consecutive connection failures a log tap tolerates; -1 is unlimited.
    pub max_log_failures: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 12345,
            flows_dir: PathBuf::from("flows"),
            log_dir: None,
            log_level: "info".to_string(),
            max_log_failures: -1,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config '{}'", path.display()))?;
        let mut config: EngineConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml_bw::from_str(&text)
                .with_context(|| format!("cannot parse config '{}'", path.display()))?,
            _ => serde_json::from_str(&text)
                .with_context(|| format!("cannot parse config '{}'", path.display()))?,
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(port) = env::var("FLOWBENCH_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(dir) = env::var("FLOWBENCH_FLOWS_DIR") {
            self.flows_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("FLOWBENCH_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = env::var("FLOWBENCH_LOG_LEVEL") {
            self.log_level = level;
        }
    }
}
