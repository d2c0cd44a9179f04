use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::models::{VendorIdentity, VendorRecord};

/// All known vendors, in the order they were first observed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    vendors: IndexMap<VendorIdentity, VendorRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }

    pub fn contains(&self, identity: &VendorIdentity) -> bool {
        self.vendors.contains_key(identity)
    }

    #[cfg(test)]
    pub fn get(&self, identity: &VendorIdentity) -> Option<&VendorRecord> {
        self.vendors.get(identity)
    }

    pub fn get_mut(&mut self, identity: &VendorIdentity) -> Option<&mut VendorRecord> {
        self.vendors.get_mut(identity)
    }

    /// Fetch the record for `identity`, creating it with `first_seen = now` if absent
    pub fn get_or_create(
        &mut self,
        identity: VendorIdentity,
        now: DateTime<Utc>,
    ) -> Result<&mut VendorRecord, AppError> {
        match self.vendors.entry(identity) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let record = VendorRecord::new(identity, now)?;
                tracing::debug!("Created vendor record for {}", identity);
                Ok(entry.insert(record))
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VendorIdentity, &VendorRecord)> {
        self.vendors.iter()
    }

    /// First entry whose map key differs from the identity stored in its record
    fn mismatched_key(&self) -> Option<(&VendorIdentity, &VendorRecord)> {
        self.vendors
            .iter()
            .find(|(key, record)| **key != record.identity)
    }
}

/// JSON snapshot of the registry on disk
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot. A missing or unreadable snapshot yields an empty registry.
    pub async fn load(&self) -> Registry {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(
                    "No existing vendor data at {}, starting fresh",
                    self.path.display()
                );
                return Registry::new();
            }
            Err(e) => {
                tracing::warn!(
                    "Error loading existing data from {}: {}",
                    self.path.display(),
                    e
                );
                return Registry::new();
            }
        };

        match serde_json::from_str::<Registry>(&raw) {
            Ok(registry) => match registry.mismatched_key() {
                None => registry,
                Some((key, record)) => {
                    tracing::warn!(
                        "Error loading existing data from {}: entry {} holds record for {}",
                        self.path.display(),
                        key,
                        record.identity
                    );
                    Registry::new()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Error loading existing data from {}: {}",
                    self.path.display(),
                    e
                );
                Registry::new()
            }
        }
    }

    /// Overwrite the snapshot with the full registry.
    ///
    /// The document is written to a sibling temporary file and renamed over the
    /// old snapshot, so an interrupted save leaves the previous one intact.
    pub async fn save(&self, registry: &Registry) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(registry)?;
        let tmp_path = self.tmp_path();

        tokio::fs::write(&tmp_path, json).await.map_err(|e| {
            AppError::StorageError(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AppError::StorageError(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            )));
        }

        tracing::info!(
            "Saved {} vendors to {}",
            registry.len(),
            self.path.display()
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
