//! Mapping registry.
//!
//! Turns the `[[mappings]]` entries of the config file into validated
//! [`Mapping`]s. Each entry is checked on its own:
//!
//! - the source root exists, or can be created;
//! - the target id is syntactically valid for the configured provider;
//! - every include/exclude glob compiles;
//! - names are unique (each name owns one state database).
//!
//! Entries that fail are collected as [`InvalidMapping`]s and skipped; the
//! remaining mappings load normally.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConflictPolicy, FilterConfig, MappingConfig};
use crate::models::SyncMode;
use crate::remote::RemoteAdapter;

/// Always excluded: hidden files and directories, editor/backup leftovers.
const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.*",
    "**/.*/**",
    "**/*.tmp",
    "**/*.bak",
    "**/__pycache__/**",
];

/// Compiled include/exclude globs, matched against document ids.
///
/// A document is included iff it matches at least one include pattern (or
/// no include patterns were given) and matches no exclude pattern.
#[derive(Debug, Clone)]
pub struct Filters {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl Filters {
    pub fn compile(config: &FilterConfig) -> Result<Self> {
        let include = if config.include.is_empty() {
            None
        } else {
            Some(build_globset(&config.include)?)
        };

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self { include, exclude })
    }

    pub fn matches(&self, id: &str) -> bool {
        if self.exclude.is_match(id) {
            return false;
        }
        match &self.include {
            Some(set) => set.is_match(id),
            None => true,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// A validated binding between a local root and a remote target.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub name: String,
    pub source_root: PathBuf,
    pub target_id: String,
    pub mode: SyncMode,
    pub conflict_policy: ConflictPolicy,
    pub filters: Filters,
    pub follow_symlinks: bool,
    pub sync_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backup_retention: u32,
}

/// A config entry that was rejected at load time.
#[derive(Debug, Clone)]
pub struct InvalidMapping {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct MappingRegistry {
    mappings: Vec<Mapping>,
    invalid: Vec<InvalidMapping>,
}

impl MappingRegistry {
    /// Validate every configured mapping against `remote`'s id syntax.
    pub fn load(configs: &[MappingConfig], remote: &dyn RemoteAdapter) -> Self {
        let mut registry = Self::default();
        let mut seen = HashSet::new();

        for config in configs {
            let name = config.display_name();
            let result = if !seen.insert(name.clone()) {
                Err(format!("duplicate mapping name '{}'", name))
            } else {
                validate(config, &name, remote)
            };

            match result {
                Ok(mapping) => registry.mappings.push(mapping),
                Err(reason) => {
                    tracing::warn!(mapping = %name, %reason, "skipping invalid mapping");
                    registry.invalid.push(InvalidMapping { name, reason });
                }
            }
        }

        registry
    }

    pub fn list_mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn invalid(&self) -> &[InvalidMapping] {
        &self.invalid
    }

    pub fn get(&self, name: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.name == name)
    }
}

fn validate(
    config: &MappingConfig,
    name: &str,
    remote: &dyn RemoteAdapter,
) -> std::result::Result<Mapping, String> {
    if name.trim().is_empty() {
        return Err("mapping name must not be empty".to_string());
    }

    let root = &config.source_path;
    if root.exists() {
        if !root.is_dir() {
            return Err(format!("source_path is not a directory: {}", root.display()));
        }
    } else {
        std::fs::create_dir_all(root).map_err(|e| {
            format!(
                "source_path does not exist and cannot be created: {}: {}",
                root.display(),
                e
            )
        })?;
    }

    if config.target_id.trim().is_empty() {
        return Err("target_id is required".to_string());
    }
    remote
        .validate_target(&config.target_id)
        .map_err(|e| format!("invalid target_id '{}': {}", config.target_id, e))?;

    let filters =
        Filters::compile(&config.filters).map_err(|e| format!("invalid filter: {}", e))?;

    if config.sync_interval == 0 {
        return Err("sync_interval must be > 0".to_string());
    }

    Ok(Mapping {
        name: name.to_string(),
        source_root: root.clone(),
        target_id: config.target_id.clone(),
        mode: config.sync_type,
        conflict_policy: config.conflict_policy,
        filters,
        follow_symlinks: config.follow_symlinks,
        sync_interval: Duration::from_secs(config.sync_interval),
        max_retries: config.max_retries,
        retry_delay: Duration::from_secs(config.retry_delay),
        backup_retention: config.backup_retention,
    })
}
