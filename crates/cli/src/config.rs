use anyhow::{bail, Context as AnyhowContext, Result};
use serde::Deserialize;
use signal_indexer::{
    CommonAnnotationPolicy, IndexPaths, RetryPolicy, ServiceConfig, DEFAULT_FILE_PATTERN,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "./server_config.json";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:9090";

pub const REQUIRED_KEYS: [&str; 5] = [
    "annotation_count_path",
    "annotation_list_path",
    "dump_dir",
    "submitted_annotation_path",
    "watch_dir",
];

/// Server configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub watch_dir: PathBuf,
    pub dump_dir: PathBuf,
    pub annotation_list_path: PathBuf,
    pub annotation_count_path: PathBuf,
    pub submitted_annotation_path: PathBuf,

    /// Regex applied to file names in the watched directory
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub allow_shutdown: bool,

    /// Load attempts for a file announced by the watcher
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,

    /// Load attempts for a file found by the startup scan
    #[serde(default = "default_initial_retries")]
    pub initial_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_rename_settle_ms")]
    pub rename_settle_ms: u64,

    #[serde(default)]
    pub common_stoplist: Option<Vec<String>>,

    #[serde(default)]
    pub common_defaults: Option<Vec<String>>,
}

fn default_file_pattern() -> String {
    DEFAULT_FILE_PATTERN.to_string()
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

const fn default_create_retries() -> u32 {
    5
}

const fn default_initial_retries() -> u32 {
    1
}

const fn default_retry_delay_ms() -> u64 {
    100
}

const fn default_rename_settle_ms() -> u64 {
    250
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        let Some(object) = value.as_object() else {
            bail!("config must be a JSON object");
        };
        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            bail!("Config file is missing required keys: {}", missing.join(", "));
        }
        Ok(serde_json::from_value(value)?)
    }

    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        let paths = IndexPaths {
            watch_dir: self.watch_dir.clone(),
            dump_dir: self.dump_dir.clone(),
            annotation_count_path: self.annotation_count_path.clone(),
            submitted_annotation_path: self.submitted_annotation_path.clone(),
        };
        let delay = Duration::from_millis(self.retry_delay_ms);
        let mut common = CommonAnnotationPolicy::default();
        if let Some(stoplist) = &self.common_stoplist {
            common.stoplist = stoplist.clone();
        }
        if let Some(defaults) = &self.common_defaults {
            common.defaults = defaults.clone();
        }

        let mut config = ServiceConfig::new(paths, &self.annotation_list_path);
        config.file_pattern = self.file_pattern.clone();
        config.initial_retry = RetryPolicy::new(self.initial_retries, delay);
        config.created_retry = RetryPolicy::new(self.create_retries, delay);
        config.common = common;
        config.rename_settle = Duration::from_millis(self.rename_settle_ms);
        config.allow_shutdown = self.allow_shutdown;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"{
        "watch_dir": "/data/in",
        "dump_dir": "/data/out",
        "annotation_list_path": "/data/annotations.json",
        "annotation_count_path": "/data/counts.json",
        "submitted_annotation_path": "/data/submitted.json"
    }"#;

    #[test]
    fn defaults_fill_optional_keys() {
        let config = ServerConfig::from_json(MINIMAL.as_bytes()).unwrap();
        assert_eq!(config.file_pattern, DEFAULT_FILE_PATTERN);
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert!(!config.allow_shutdown);

        let service = config.service_config();
        assert_eq!(service.created_retry.attempts, 5);
        assert_eq!(service.initial_retry.attempts, 1);
        assert_eq!(service.created_retry.delay, Duration::from_millis(100));
        assert_eq!(service.rename_settle, Duration::from_millis(250));
        assert_eq!(service.common.defaults, ["Normal rhythm"]);
        assert!(service.watch);
    }

    #[test]
    fn missing_keys_are_listed_sorted() {
        let err = ServerConfig::from_json(br#"{"watch_dir": "/in", "dump_dir": "/out"}"#)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Config file is missing required keys: annotation_count_path, annotation_list_path, submitted_annotation_path"
        );
    }

    #[test]
    fn overrides_reach_service_config() {
        let mut value: serde_json::Value = serde_json::from_str(MINIMAL).unwrap();
        value["file_pattern"] = serde_json::json!(r"^.+\.xml$");
        value["allow_shutdown"] = serde_json::json!(true);
        value["create_retries"] = serde_json::json!(2);
        value["common_stoplist"] = serde_json::json!(["Noise"]);
        let config = ServerConfig::from_json(value.to_string().as_bytes()).unwrap();

        let service = config.service_config();
        assert_eq!(service.file_pattern, r"^.+\.xml$");
        assert!(service.allow_shutdown);
        assert_eq!(service.created_retry.attempts, 2);
        assert_eq!(service.common.stoplist, ["Noise"]);
    }

    #[test]
    fn non_object_config_is_rejected() {
        assert!(ServerConfig::from_json(b"[]").is_err());
    }
}
