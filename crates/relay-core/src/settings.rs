//! Hierarchical runtime settings.
//!
//! Settings come from a config file with environment-variable overrides
//! (prefix `RELAY`, `__` as the section separator). Every key has a default
//! so a minimal deployment only sets the store URI, the bus host, and the
//! rule file path.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mongodb: MongoSettings,
    #[serde(rename = "bufferInput", alias = "bufferinput")]
    pub buffer_input: BufferSettings,
    pub gravity: GravitySettings,
    pub subscriber: SubscriberSettings,
    #[serde(rename = "initialLoad", alias = "initialload")]
    pub initial_load: InitialLoadSettings,
    pub rules: RuleSettings,
}

impl Settings {
    /// Load from the named config file (extension resolved by the config
    /// crate) and apply environment overrides.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("RELAY").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Document store connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongoSettings {
    pub uri: String,
    /// Optional PEM CA bundle installed as the root trust set
    pub ca_file: Option<PathBuf>,
    pub dbname: String,
}

impl Default for MongoSettings {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            ca_file: None,
            dbname: "relay".to_string(),
        }
    }
}

/// Batch aggregator thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BufferSettings {
    /// Flush once this many commands are buffered
    #[serde(alias = "chunksize")]
    pub chunk_size: usize,
    /// Flush this many milliseconds after the first buffered command
    pub timeout: u64,
}

impl BufferSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            timeout: 50,
        }
    }
}

/// Event bus location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GravitySettings {
    pub domain: String,
    pub host: String,
}

impl Default for GravitySettings {
    fn default() -> Self {
        Self {
            domain: "gravity".to_string(),
            host: "localhost:4222".to_string(),
        }
    }
}

/// Upstream subscription identity and sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriberSettings {
    #[serde(alias = "workercount")]
    pub worker_count: usize,
    pub verbose: bool,
    /// Per-worker delivery buffer size
    #[serde(alias = "chunksize")]
    pub chunk_size: usize,
    #[serde(rename = "appID", alias = "appid")]
    pub app_id: String,
    #[serde(alias = "accesskey")]
    pub access_key: String,
    #[serde(rename = "subscriberID", alias = "subscriberid")]
    pub subscriber_id: String,
    #[serde(alias = "subscribername")]
    pub subscriber_name: String,
    #[serde(alias = "pipelinestart")]
    pub pipeline_start: i64,
    /// `-1` means "all pipelines up to the last"
    #[serde(alias = "pipelineend")]
    pub pipeline_end: i64,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            verbose: false,
            chunk_size: 2048,
            app_id: "anonymous".to_string(),
            access_key: String::new(),
            subscriber_id: String::new(),
            subscriber_name: String::new(),
            pipeline_start: 0,
            pipeline_end: -1,
        }
    }
}

/// Initial load (snapshot) options forwarded to the bus at registration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitialLoadSettings {
    pub enabled: bool,
    #[serde(alias = "omittedcount")]
    pub omitted_count: u64,
}

/// Rule file location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub subscription: PathBuf,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            subscription: PathBuf::from("rules.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.gravity.domain, "gravity");
        assert_eq!(settings.subscriber.worker_count, 4);
        assert_eq!(settings.subscriber.app_id, "anonymous");
        assert_eq!(settings.subscriber.pipeline_start, 0);
        assert_eq!(settings.subscriber.pipeline_end, -1);
        assert!(!settings.initial_load.enabled);
        assert_eq!(settings.rules.subscription, PathBuf::from("rules.json"));
    }

    #[test]
    fn camel_case_keys_deserialize() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "mongodb": {"uri": "mongodb://db:27017", "dbname": "prod"},
                "bufferInput": {"chunkSize": 64, "timeout": 200},
                "subscriber": {"workerCount": 8, "appID": "sink-1", "pipelineEnd": 3},
                "initialLoad": {"enabled": true, "omittedCount": 10}
            }"#,
        )
        .unwrap();
        assert_eq!(settings.mongodb.dbname, "prod");
        assert_eq!(settings.buffer_input.chunk_size, 64);
        assert_eq!(settings.buffer_input.timeout(), Duration::from_millis(200));
        assert_eq!(settings.subscriber.worker_count, 8);
        assert_eq!(settings.subscriber.app_id, "sink-1");
        assert_eq!(settings.subscriber.pipeline_end, 3);
        assert!(settings.initial_load.enabled);
        assert_eq!(settings.initial_load.omitted_count, 10);
    }
}
