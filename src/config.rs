use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Broker settings, loadable from `tenantdb.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Host-provided data directory; databases live under `ModData/DatabaseManager`
    pub data_root: PathBuf,
    /// Database name used when the caller does not give one
    pub default_database: String,
    /// Busy timeout applied to every issued connection
    pub busy_timeout_ms: u64,
    /// Hold a per-(tenant, database) lock during first-open validation
    pub serialize_first_open: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("."),
            default_database: crate::DEFAULT_DATABASE.to_string(),
            busy_timeout_ms: 5000,
            serialize_first_open: true,
        }
    }
}

impl BrokerConfig {
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("tenantdb.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<BrokerConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: BrokerConfig = toml::from_str(&contents)?;
    if config.default_database.trim().is_empty() {
        anyhow::bail!("default_database in {} must not be blank", path.display());
    }
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &BrokerConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenantdb.toml");
        let mut config = BrokerConfig::with_data_root("/srv/host");
        config.busy_timeout_ms = 250;

        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());
        write_config(&path, &config, true).unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.data_root, PathBuf::from("/srv/host"));
        assert_eq!(loaded.busy_timeout(), Duration::from_millis(250));
        assert_eq!(loaded.default_database, "main");
        assert!(loaded.serialize_first_open);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenantdb.toml");
        std::fs::write(&path, "data_root = \"/data\"\n").unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.busy_timeout_ms, 5000);
        assert_eq!(loaded.default_database, "main");
    }

    #[test]
    fn test_blank_default_database_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenantdb.toml");
        std::fs::write(&path, "default_database = \"  \"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
