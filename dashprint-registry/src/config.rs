//! The persisted `Configuration` document and its load/save.

use std::path::{Path, PathBuf};

use dashprint_core::PrinterSettings;
use serde::{Deserialize, Serialize};

/// The on-disk shape of a registry: every printer's settings plus which one
/// is the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub printers: Vec<PrinterSettings>,
    #[serde(rename = "defaultPrinter", default, skip_serializing_if = "Option::is_none")]
    pub default_printer: Option<String>,
}

/// Failures loading or saving a [`Configuration`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine a data directory for the configuration file")]
    NoDataDir,
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves the configuration file's path and loads/saves the document
/// there: `$XDG_DATA_HOME/dashprint.json`, falling back to
/// `$HOME/.local/share/dashprint.json` when `XDG_DATA_HOME` is unset, the
/// same fallback `directories_next::BaseDirs` applies internally.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Resolves the standard path via `directories_next`.
    pub fn discover() -> Result<Self, ConfigError> {
        let dirs = directories_next::BaseDirs::new().ok_or(ConfigError::NoDataDir)?;
        Ok(Self::at(dirs.data_dir().join("dashprint.json")))
    }

    /// Points the store at an explicit path — used by tests and by callers
    /// that don't want the XDG default.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the configuration, if the file exists. A missing file is not
    /// an error: it means "no configuration yet", and callers should start
    /// the registry empty.
    pub async fn load(&self) -> Result<Option<Configuration>, ConfigError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Read {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    /// Serializes `config` and rewrites the file atomically (write to a
    /// sibling temp file, then rename over the real path), creating the
    /// parent directory if needed. Mode 0644 on unix.
    pub async fn save(&self, config: &Configuration) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::Write {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        let body = serde_json::to_vec_pretty(config)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|e| ConfigError::Write {
                path: tmp_path.clone(),
                source: e,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644))
                .await;
        }

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| ConfigError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashprint_core::{PrintArea, PrinterSettings};

    fn sample_config() -> Configuration {
        Configuration {
            printers: vec![PrinterSettings {
                name: "Prusa".into(),
                unique_name: "prusa".into(),
                device_path: "/dev/ttyUSB0".into(),
                baud_rate: 250_000,
                stopped: false,
                print_area: PrintArea {
                    width: 250,
                    height: 210,
                    depth: 210,
                },
            }],
            default_printer: Some("prusa".into()),
        }
    }

    fn temp_dir(label: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "dashprint-registry-test-{label}-{}",
            std::process::id()
        ));
        dir
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = temp_dir("missing");
        let store = ConfigStore::at(dir.join("dashprint.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("dashprint.json");
        let store = ConfigStore::at(&path);
        let config = sample_config();

        store.save(&config).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, config);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = temp_dir("notemp");
        let path = dir.join("dashprint.json");
        let store = ConfigStore::at(&path);
        store.save(&sample_config()).await.unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
