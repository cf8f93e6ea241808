//! In-memory authoritative configuration with an update-hook chain and
//! JSON persistence, grounded in `x/api/config_service.go`'s repeated
//! `config.OnUpdate(func(c *Config) error {...})` usage throughout the
//! original controller.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;

use super::types::GostConfig;

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("update callback failed: {0}")]
    Update(String),
}

/// Single read/write lock over the authoritative config, mirroring the
/// "config store: single read/write lock" shared-resource policy.
///
/// `on_update` callbacks run under the write lock and must not block on
/// external I/O beyond the disk flush performed here.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<GostConfig>,
}

impl ConfigStore {
    /// Loads `path` if it exists, otherwise starts from an empty config
    /// (first run writes `gost.json` on the first mutation).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigStoreError> {
        let path = path.into();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| ConfigStoreError::Read {
                path: path.clone(),
                source: e,
            })?;
            serde_json::from_str(&raw).map_err(|e| ConfigStoreError::Parse {
                path: path.clone(),
                source: e,
            })?
        } else {
            GostConfig::default()
        };
        Ok(Self {
            path,
            inner: RwLock::new(config),
        })
    }

    /// Returns a cloned snapshot of the live configuration.
    pub fn global(&self) -> GostConfig {
        self.inner.read().expect("config store lock poisoned").clone()
    }

    /// Applies `f` to the live config under the write lock, then persists
    /// to disk. If `f` returns an error the config is left unmodified and
    /// nothing is written. Persistence uses a temp-file + rename so a
    /// crash mid-write never leaves a truncated `gost.json` on disk.
    pub fn on_update<F>(&self, f: F) -> Result<(), ConfigStoreError>
    where
        F: FnOnce(&mut GostConfig) -> Result<(), String>,
    {
        let mut guard = self.inner.write().expect("config store lock poisoned");
        let mut candidate = guard.clone();
        f(&mut candidate).map_err(ConfigStoreError::Update)?;
        self.persist(&candidate)?;
        *guard = candidate;
        Ok(())
    }

    fn persist(&self, config: &GostConfig) -> Result<(), ConfigStoreError> {
        let body = serde_json::to_string_pretty(config).expect("GostConfig always serialises");
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = dir.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("gost.json")
        ));
        std::fs::write(&tmp, body).map_err(|e| ConfigStoreError::Write {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ConfigStoreError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ServiceConfig;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gost.json");
        let store = ConfigStore::load(&path).unwrap();

        store
            .on_update(|c| {
                c.services.push(ServiceConfig {
                    name: "s1".into(),
                    addr: ":10001".into(),
                    ..Default::default()
                });
                Ok(())
            })
            .unwrap();

        assert!(path.exists());
        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.global().services.len(), 1);
    }

    #[test]
    fn failed_update_leaves_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gost.json");
        let store = ConfigStore::load(&path).unwrap();

        store
            .on_update(|c| {
                c.services.push(ServiceConfig {
                    name: "s1".into(),
                    addr: ":10001".into(),
                    ..Default::default()
                });
                Ok(())
            })
            .unwrap();

        let before = store.global();
        let err = store.on_update(|c| {
            c.services.push(ServiceConfig {
                name: "s2".into(),
                addr: ":10002".into(),
                ..Default::default()
            });
            Err("boom".to_string())
        });
        assert!(err.is_err());
        assert_eq!(store.global().services.len(), before.services.len());
    }
}
