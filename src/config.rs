//! JSON configuration file loading.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration, deserialized from the JSON file handed to the
/// CLI. Missing mandatory sections fail deserialization and abort startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Worker count on this machine.
    pub workers: u16,
    /// Machine count across the whole deployment.
    pub machines: u16,

    #[serde(default)]
    pub debug_level_logging: bool,
    #[serde(default)]
    pub json_logging: bool,

    pub aws: AwsConfig,
    pub artifact: ArtifactConfig,
    pub coordinator: CoordinatorConfig,
    pub crawling: CrawlingConfig,
    pub url_frontier: UrlFrontierConfig,
    #[serde(default)]
    pub tracer: Option<TracerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Optional S3-compatible endpoint. When set, path-style addressing is
    /// forced so MinIO-style servers work.
    #[serde(default)]
    pub s3_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    pub bucket: String,
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub redis_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlingConfig {
    /// Value sent in the User-Agent header.
    pub header_ua: String,
    /// robots.txt group looked up first.
    pub primary_ua: String,
    /// robots.txt group looked up when the primary one is absent.
    pub secondary_ua: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UrlFrontierConfig {
    /// Which frontier implementation backs the crawl.
    #[serde(default)]
    pub variant: FrontierVariant,
    /// Connection string of the shared `urls` table (sql variant).
    pub shared_db_source: String,
    /// Redis holding the per-shard URL streams (redis_stream variant).
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Per-worker SQLite path template; `%d` is replaced by the GWN. When
    /// absent the crawled-host set lives in memory.
    #[serde(default)]
    pub local_db_path: Option<String>,
    /// TLD allow-list; empty means no filtering.
    #[serde(default)]
    pub tld_filter: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierVariant {
    #[default]
    Sql,
    RedisStream,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracerConfig {
    pub namespace: String,
    pub dim_name: String,
    pub dim_value: String,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read configuration: {}", path.as_ref().display()))?;
        let config: Config =
            serde_json::from_str(&content).context("failed to parse configuration")?;
        Ok(config)
    }

    /// Worker count across the whole fleet; the domain of `shard(·)`.
    pub fn total_workers(&self) -> u16 {
        self.workers * self.machines
    }

    /// Local test setups run with placeholder AWS credentials; the tracer is
    /// disabled for those so nothing is pushed to a real metrics sink.
    pub fn aws_may_be_dummy(&self) -> bool {
        let dummyish = |s: &str| s.is_empty() || s.to_lowercase().starts_with("dummy");
        dummyish(&self.aws.access_key_id) || dummyish(&self.aws.secret_access_key)
    }

    pub fn tracer_enabled(&self) -> bool {
        self.tracer.is_some() && !self.aws_may_be_dummy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "workers": 2,
            "machines": 3,
            "debug_level_logging": true,
            "json_logging": false,
            "aws": {
                "region": "us-east-1",
                "access_key_id": "AKIAEXAMPLE",
                "secret_access_key": "secret",
                "s3_endpoint": "http://127.0.0.1:9000"
            },
            "artifact": { "bucket": "crawled", "key_prefix": "artifacts" },
            "coordinator": { "redis_url": "redis://127.0.0.1:6379" },
            "crawling": {
                "header_ua": "gokurou/0.1",
                "primary_ua": "gokurou",
                "secondary_ua": "googlebot"
            },
            "url_frontier": {
                "shared_db_source": "mysql://root@127.0.0.1/gokurou",
                "local_db_path": "/tmp/gokurou-%d.sqlite",
                "tld_filter": ["com", "jp"]
            },
            "tracer": {
                "namespace": "gokurou",
                "dim_name": "cluster",
                "dim_value": "test"
            }
        }"#
    }

    #[test]
    fn parses_full_configuration() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.machines, 3);
        assert_eq!(config.total_workers(), 6);
        assert_eq!(config.url_frontier.tld_filter, vec!["com", "jp"]);
        assert_eq!(
            config.aws.s3_endpoint.as_deref(),
            Some("http://127.0.0.1:9000")
        );
        assert!(config.tracer_enabled());
    }

    #[test]
    fn missing_mandatory_section_fails() {
        let err = serde_json::from_str::<Config>(r#"{"workers": 1, "machines": 1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn optional_keys_default() {
        let json = sample_json()
            .replace(r#""local_db_path": "/tmp/gokurou-%d.sqlite","#, "")
            .replace(r#""s3_endpoint": "http://127.0.0.1:9000""#, r#""s3_endpoint": null"#);
        let config: Config = serde_json::from_str(&json).unwrap();
        assert!(config.url_frontier.local_db_path.is_none());
        assert!(config.aws.s3_endpoint.is_none());
    }

    #[test]
    fn dummy_credentials_disable_tracer() {
        let json = sample_json().replace("AKIAEXAMPLE", "dummy-access-key");
        let config: Config = serde_json::from_str(&json).unwrap();
        assert!(config.aws_may_be_dummy());
        assert!(!config.tracer_enabled());
    }
}
