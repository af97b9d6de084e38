//! Repository configuration, loadable from TOML.
//!
//! ```toml
//! workspaces = ["default", "staging"]
//! default_workspace = "default"
//!
//! [journal]
//! path = "/var/lib/cairn/items.journal"
//! sync_mode = "every_write"
//!
//! [versioning]
//! lock_timeout_ms = 500
//!
//! [cache]
//! capacity = 10000
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cairn_hierarchy::CacheConfig;
use cairn_state::SyncMode;
use cairn_types::Name;
use cairn_version::VersioningConfig;

use crate::error::{RepoError, RepoResult};

/// Durable item storage. Without it the repository lives in memory only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub sync_mode: SyncMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Every workspace gets its own root node below the repository root.
    pub workspaces: Vec<String>,
    pub default_workspace: String,
    pub journal: Option<JournalConfig>,
    pub versioning: VersioningConfig,
    pub cache: CacheConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            workspaces: vec!["default".into()],
            default_workspace: "default".into(),
            journal: None,
            versioning: VersioningConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl RepositoryConfig {
    pub fn from_toml_str(s: &str) -> RepoResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> RepoResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Workspace names must be distinct plain names and include the
    /// default workspace.
    pub fn validate(&self) -> RepoResult<()> {
        if self.workspaces.is_empty() {
            return Err(RepoError::Config("at least one workspace is required".into()));
        }
        let mut seen = HashSet::new();
        for name in &self.workspaces {
            Name::local(name.as_str())
                .map_err(|e| RepoError::Config(format!("workspace name {name:?}: {e}")))?;
            if !seen.insert(name.as_str()) {
                return Err(RepoError::Config(format!("workspace {name:?} is listed twice")));
            }
        }
        if !seen.contains(self.default_workspace.as_str()) {
            return Err(RepoError::Config(format!(
                "default workspace {:?} is not among the workspaces",
                self.default_workspace
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = RepositoryConfig::default();
        assert_eq!(config.workspaces, vec!["default".to_string()]);
        assert_eq!(config.default_workspace, "default");
        assert!(config.journal.is_none());
        assert_eq!(config.versioning, VersioningConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let config = RepositoryConfig::from_toml_str(
            r#"
            workspaces = ["default", "staging"]
            default_workspace = "staging"

            [journal]
            path = "/tmp/cairn/items.journal"
            sync_mode = "every_write"

            [versioning]
            fanout_depth = 2
            lock_timeout_ms = 500

            [cache]
            capacity = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.workspaces.len(), 2);
        assert_eq!(config.default_workspace, "staging");
        let journal = config.journal.unwrap();
        assert_eq!(journal.path, PathBuf::from("/tmp/cairn/items.journal"));
        assert_eq!(journal.sync_mode, SyncMode::EveryWrite);
        assert_eq!(config.versioning.fanout_depth, 2);
        assert_eq!(config.versioning.fanout_width, 2);
        assert_eq!(config.versioning.lock_timeout_ms, Some(500));
        assert_eq!(config.cache.capacity, 64);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = RepositoryConfig::from_toml_str("").unwrap();
        assert_eq!(config, RepositoryConfig::default());
    }

    #[test]
    fn unknown_default_workspace_is_rejected() {
        let err = RepositoryConfig::from_toml_str(r#"default_workspace = "prod""#).unwrap_err();
        assert!(matches!(err, RepoError::Config(_)));
    }

    #[test]
    fn bad_workspace_names_are_rejected() {
        assert!(matches!(
            RepositoryConfig::from_toml_str(r#"workspaces = ["default", "default"]"#),
            Err(RepoError::Config(_))
        ));
        assert!(matches!(
            RepositoryConfig::from_toml_str(r#"workspaces = ["a/b"]"#),
            Err(RepoError::Config(_))
        ));
        assert!(matches!(
            RepositoryConfig::from_toml_str("workspaces = 3"),
            Err(RepoError::Toml(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workspaces = [\"default\", \"archive\"]").unwrap();
        let config = RepositoryConfig::load(file.path()).unwrap();
        assert_eq!(config.workspaces[1], "archive");

        assert!(matches!(
            RepositoryConfig::load(&file.path().with_extension("missing")),
            Err(RepoError::Io(_))
        ));
    }
}
