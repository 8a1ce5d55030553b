use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::SyncMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./.docsync")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub notion: NotionConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            timeout_secs: default_timeout_secs(),
            notion: NotionConfig::default(),
        }
    }
}

fn default_provider() -> String {
    "notion".to_string()
}
fn default_requests_per_second() -> f64 {
    3.0
}
fn default_burst() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotionConfig {
    #[serde(default = "default_notion_base_url")]
    pub base_url: String,
    #[serde(default = "default_notion_version")]
    pub api_version: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for NotionConfig {
    fn default() -> Self {
        Self {
            base_url: default_notion_base_url(),
            api_version: default_notion_version(),
            token_env: default_token_env(),
        }
    }
}

fn default_notion_base_url() -> String {
    "https://api.notion.com/v1".to_string()
}
fn default_notion_version() -> String {
    "2022-06-28".to_string()
}
fn default_token_env() -> String {
    "NOTION_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Concurrent document applies per mapping.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_max_concurrent_mappings")]
    pub max_concurrent_mappings: usize,
    /// Minimum mtime gap for the newest-wins conflict policy to pick a side.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_concurrent_mappings: default_max_concurrent_mappings(),
            clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

fn default_parallelism() -> usize {
    4
}
fn default_max_concurrent_mappings() -> usize {
    2
}
fn default_clock_skew_secs() -> u64 {
    5
}

/// How a mapping settles documents changed on both sides.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Most recent modification wins, beyond the clock-skew tolerance.
    #[default]
    Newest,
    /// Local content always wins.
    Local,
    /// Remote content always wins.
    Remote,
    /// Never resolve automatically.
    Manual,
}

/// A mapping exactly as written in the config file. Validation happens in
/// the registry so that one bad mapping does not reject the whole file.
#[derive(Debug, Deserialize, Clone)]
pub struct MappingConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub source_path: PathBuf,
    pub target_id: String,
    #[serde(default)]
    pub sync_type: SyncMode,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: u32,
}

fn default_sync_interval() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}
fn default_backup_retention() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include: default_include(),
            exclude: Vec::new(),
        }
    }
}

fn default_include() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.rst".to_string(),
    ]
}

impl MappingConfig {
    /// The mapping's name, falling back to its target id.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.target_id.replace('-', ""),
        }
    }
}

impl Config {
    /// Config with no mappings and the in-memory provider, for tests and embedding.
    pub fn minimal() -> Self {
        Self {
            state: StateConfig::default(),
            remote: RemoteConfig {
                provider: "memory".to_string(),
                ..RemoteConfig::default()
            },
            sync: SyncConfig::default(),
            mappings: Vec::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.remote.provider.as_str() {
        "notion" | "memory" => {}
        other => bail!(
            "Unknown remote provider: '{}'. Must be notion or memory.",
            other
        ),
    }

    if !(config.remote.requests_per_second > 0.0) {
        bail!("remote.requests_per_second must be > 0");
    }
    if config.remote.burst == 0 {
        bail!("remote.burst must be >= 1");
    }
    if config.remote.timeout_secs == 0 {
        bail!("remote.timeout_secs must be > 0");
    }
    if config.sync.parallelism == 0 {
        bail!("sync.parallelism must be > 0");
    }
    if config.sync.max_concurrent_mappings == 0 {
        bail!("sync.max_concurrent_mappings must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mapping_with_defaults() {
        let config: Config = toml::from_str(
            r#"
[[mappings]]
source_path = "./docs"
target_id = "db_123"
"#,
        )
        .unwrap();

        let m = &config.mappings[0];
        assert_eq!(m.sync_type, SyncMode::Bidirectional);
        assert_eq!(m.conflict_policy, ConflictPolicy::Newest);
        assert_eq!(m.max_retries, 3);
        assert_eq!(m.retry_delay, 5);
        assert_eq!(m.backup_retention, 5);
        assert_eq!(m.filters.include.len(), 3);
        assert_eq!(m.display_name(), "db_123");
        assert_eq!(config.remote.provider, "notion");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn accepts_legacy_mode_aliases() {
        let config: Config = toml::from_str(
            r#"
[[mappings]]
source_path = "./a"
target_id = "t1"
sync_type = "upload_only"

[[mappings]]
source_path = "./b"
target_id = "t2"
sync_type = "download_only"
"#,
        )
        .unwrap();
        assert_eq!(config.mappings[0].sync_type, SyncMode::Push);
        assert_eq!(config.mappings[1].sync_type, SyncMode::Pull);
    }

    #[test]
    fn rejects_unknown_provider_and_zero_parallelism() {
        let mut config = Config::minimal();
        config.remote.provider = "dropbox".to_string();
        assert!(validate(&config).is_err());

        let mut config = Config::minimal();
        config.sync.parallelism = 0;
        assert!(validate(&config).is_err());
    }
}
