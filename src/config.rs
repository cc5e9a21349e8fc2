//! Runtime configuration.
//!
//! `PipelineConfig` carries the orchestrator's tuning knobs; `FileConfig` is
//! the optional `mangaforge.toml` on disk, merged with environment variables
//! (loaded via dotenv) and CLI arguments by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Orchestrator tuning knobs, independent of any one session.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Global cap on concurrently running sessions.
    pub max_concurrent_sessions: usize,
    /// Explicit `retry` budget per session.
    pub session_max_retries: u32,
    /// Model-call attempt budget per phase execution.
    pub phase_max_retries: u32,
    /// Backoff base for agent retries.
    pub agent_backoff_base: Duration,
    /// Backoff base for image-task retries.
    pub image_backoff_base: Duration,
    /// TTL for interim checkpoints in the cache store.
    pub cache_ttl_secs: u64,
    /// Sessions untouched for this long are reaped as failed.
    pub stale_after_minutes: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 8,
            session_max_retries: 3,
            phase_max_retries: 3,
            agent_backoff_base: Duration::from_secs(1),
            image_backoff_base: Duration::from_secs(2),
            cache_ttl_secs: crate::store::cache::DEFAULT_TTL_SECS,
            stale_after_minutes: 60,
        }
    }
}

/// Backend connection settings from `mangaforge.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_api_key_env() -> String {
    "MANGAFORGE_API_KEY".to_string()
}

/// Storage settings from `mangaforge.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Path to the SQLite database; empty means in-memory.
    #[serde(default)]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineSection {
    #[serde(default)]
    pub max_concurrent_sessions: Option<usize>,
    #[serde(default)]
    pub session_max_retries: Option<u32>,
    #[serde(default)]
    pub phase_max_retries: Option<u32>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub stale_after_minutes: Option<i64>,
}

/// The `mangaforge.toml` file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load `mangaforge.toml` from the given directory if present.
    pub fn discover(dir: &Path) -> Result<Self> {
        let path = dir.join("mangaforge.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Fold file settings over the built-in pipeline defaults.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            max_concurrent_sessions: self
                .pipeline
                .max_concurrent_sessions
                .unwrap_or(defaults.max_concurrent_sessions),
            session_max_retries: self
                .pipeline
                .session_max_retries
                .unwrap_or(defaults.session_max_retries),
            phase_max_retries: self
                .pipeline
                .phase_max_retries
                .unwrap_or(defaults.phase_max_retries),
            cache_ttl_secs: self.pipeline.cache_ttl_secs.unwrap_or(defaults.cache_ttl_secs),
            stale_after_minutes: self
                .pipeline
                .stale_after_minutes
                .unwrap_or(defaults.stale_after_minutes),
            ..defaults
        }
    }

    /// Database path, or `None` for the in-memory store.
    pub fn db_path(&self) -> Option<PathBuf> {
        if self.storage.db_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.storage.db_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = FileConfig::discover(dir.path()).unwrap();
        assert!(config.backend.base_url.is_empty());
        assert_eq!(config.backend.api_key_env, "MANGAFORGE_API_KEY");
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.max_concurrent_sessions, 8);
        assert_eq!(pipeline.phase_max_retries, 3);
    }

    #[test]
    fn file_settings_override_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("mangaforge.toml"),
            r#"
            [backend]
            base_url = "https://backend.example"

            [storage]
            db_path = "pipeline.db"

            [pipeline]
            max_concurrent_sessions = 2
            cache_ttl_secs = 120
            "#,
        )
        .unwrap();

        let config = FileConfig::discover(dir.path()).unwrap();
        assert_eq!(config.backend.base_url, "https://backend.example");
        assert_eq!(config.db_path().unwrap(), PathBuf::from("pipeline.db"));
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.max_concurrent_sessions, 2);
        assert_eq!(pipeline.cache_ttl_secs, 120);
        assert_eq!(pipeline.session_max_retries, 3);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mangaforge.toml");
        fs::write(&path, "not [valid").unwrap();
        let err = FileConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }
}
