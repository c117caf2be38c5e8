//! Configuration loader with tier-based merging.

use super::merge::merge_tier;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Project-level config directory
    pub project_dir: Option<PathBuf>,
    /// User-level config directory
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        let user_dir = std::env::var("DOC_SPAWNER_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".doc-spawner")));

        let project_dir = std::env::var("DOC_SPAWNER_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("doc-spawner")));

        Self {
            project_dir,
            user_dir,
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Highest-precedence file that contributed, if any
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load a single explicit file, skipping the project and user tiers.
    pub fn load_file(path: &Path) -> Result<Self> {
        let mut config = Config::load(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?;
        Self::apply_env_overrides(&mut config);
        Ok(Self {
            paths: ConfigPaths::with_dirs(None, None),
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Load configuration with explicit tier directories.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        if let Ok(explicit) = std::env::var("DOC_SPAWNER_CONFIG_PATH") {
            return Self::load_file(Path::new(&explicit));
        }

        let mut merged = serde_json::to_value(Config::default())?;
        let mut config_path = None;

        for dir in [paths.project_dir.as_ref(), paths.user_dir.as_ref()]
            .into_iter()
            .flatten()
        {
            let file = dir.join("config.yaml");
            let Some(tier) = read_yaml_tier(&file) else {
                continue;
            };
            match merge_tier(&mut merged, tier) {
                Ok(()) => config_path = Some(file),
                Err(e) => warn!("Ignoring config {}: {}", file.display(), e),
            }
        }

        let mut config: Config = serde_json::from_value(merged)
            .context("merged config tiers do not form a valid config")?;

        Self::apply_env_overrides(&mut config);

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    fn apply_env_overrides(config: &mut Config) {
        if let Ok(db_path) = std::env::var("DOC_SPAWNER_DB_PATH") {
            config.store.db_path = PathBuf::from(db_path);
        }

        if let Ok(workers) = std::env::var("DOC_SPAWNER_NUM_WORKERS") {
            match workers.parse() {
                Ok(n) => config.queue.num_workers = n,
                Err(_) => warn!("Ignoring invalid DOC_SPAWNER_NUM_WORKERS '{}'", workers),
            }
        }

        if let Ok(depth) = std::env::var("DOC_SPAWNER_MAX_DEPTH") {
            match depth.parse() {
                Ok(n) => config.queue.max_depth = n,
                Err(_) => warn!("Ignoring invalid DOC_SPAWNER_MAX_DEPTH '{}'", depth),
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Read one tier's YAML file. Missing files are skipped silently, unreadable
/// or malformed ones with a warning.
fn read_yaml_tier(file: &Path) -> Option<Value> {
    if !file.exists() {
        return None;
    }

    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {}: {}", file.display(), e);
            return None;
        }
    };

    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => {
            debug!("Loaded config tier {}", file.display());
            Some(value)
        }
        Err(e) => {
            warn!("Ignoring malformed config {}: {}", file.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp = TempDir::new().unwrap();
        let paths = ConfigPaths::with_dirs(
            Some(temp.path().join("project")),
            Some(temp.path().join("user")),
        );

        let loader = ConfigLoader::load_with_paths(paths).unwrap();
        assert_eq!(loader.config().queue.num_workers, 3);
        assert_eq!(loader.config().queue.max_depth, 5);
        assert!(loader.config_path().is_none());
    }

    #[test]
    fn test_user_config_overrides_project() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("doc-spawner");
        let user_dir = temp.path().join("user");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::create_dir_all(&user_dir).unwrap();

        std::fs::write(
            project_dir.join("config.yaml"),
            "queue:\n  num_workers: 6\n  max_depth: 2\n",
        )
        .unwrap();
        std::fs::write(user_dir.join("config.yaml"), "queue:\n  num_workers: 9\n").unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir), Some(user_dir.clone()));
        let loader = ConfigLoader::load_with_paths(paths).unwrap();

        assert_eq!(loader.config().queue.num_workers, 9);
        assert_eq!(loader.config().queue.max_depth, 2);
        assert_eq!(loader.config_path(), Some(user_dir.join("config.yaml").as_path()));
    }

    #[test]
    fn test_malformed_tier_is_skipped() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("doc-spawner");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("config.yaml"), "queue: [unclosed").unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir), None);
        let loader = ConfigLoader::load_with_paths(paths).unwrap();
        assert_eq!(loader.config().queue.num_workers, 3);
    }

    #[test]
    fn test_tier_with_unknown_section_is_skipped() {
        let temp = TempDir::new().unwrap();
        let project_dir = temp.path().join("doc-spawner");
        let user_dir = temp.path().join("user");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::create_dir_all(&user_dir).unwrap();

        std::fs::write(project_dir.join("config.yaml"), "queue:\n  max_depth: 2\n").unwrap();
        std::fs::write(
            user_dir.join("config.yaml"),
            "queue:\n  num_workers: 9\nworker:\n  count: 4\n",
        )
        .unwrap();

        let paths = ConfigPaths::with_dirs(Some(project_dir.clone()), Some(user_dir));
        let loader = ConfigLoader::load_with_paths(paths).unwrap();

        assert_eq!(loader.config().queue.num_workers, 3);
        assert_eq!(loader.config().queue.max_depth, 2);
        assert_eq!(
            loader.config_path(),
            Some(project_dir.join("config.yaml").as_path())
        );
    }

    #[test]
    fn test_load_file_reads_single_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("custom.yaml");
        std::fs::write(&file, "store:\n  db_path: /tmp/x.db\n").unwrap();

        let loader = ConfigLoader::load_file(&file).unwrap();
        assert_eq!(loader.config().store.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(loader.config().queue.num_workers, 3);
    }

    #[test]
    fn test_load_file_rejects_unknown_section() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("custom.yaml");
        std::fs::write(&file, "stores:\n  db_path: /tmp/x.db\n").unwrap();

        let err = ConfigLoader::load_file(&file).unwrap_err();
        assert!(format!("{err:#}").contains("unknown section 'stores'"));
    }
}
