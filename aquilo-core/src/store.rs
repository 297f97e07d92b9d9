//! JSON persistence for control profiles
//!
//! The engine treats the store as the sole persistence authority: profiles
//! are loaded once at startup and written through on every accepted mutation.
//! The engine never mutates stored profiles on its own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::constants::{limits, paths};
use crate::profile::{generate_profile_id, Profile};
use aquilo_error::{AquiloError, Result};

/// Narrow persistence interface the engine talks to.
///
/// The default implementation is file-backed JSON; anything honoring these
/// three operations can stand in (the engine holds it behind a trait object).
pub trait ProfileStore: Send + Sync {
    /// Load all stored profiles
    fn load(&self) -> Result<Vec<Profile>>;
    /// Persist one profile (insert or replace by id)
    fn save(&self, profile: &Profile) -> Result<()>;
    /// Delete a profile by id; returns false if it was not stored
    fn delete(&self, id: &str) -> Result<bool>;
}

/// On-disk document holding all profiles
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredProfiles {
    version: u32,
    profiles: HashMap<String, Profile>,
}

impl StoredProfiles {
    fn new() -> Self {
        Self { version: 1, profiles: HashMap::new() }
    }
}

/// File-backed profile store with atomic writes
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default user config location
    pub fn at_default_path() -> Self {
        Self::new(paths::profiles_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<StoredProfiles> {
        if !self.path.exists() {
            debug!("No profile store at {:?}, starting empty", self.path);
            return Ok(StoredProfiles::new());
        }

        let metadata = fs::metadata(&self.path)?;
        if metadata.len() > limits::MAX_STORE_FILE_SIZE {
            return Err(AquiloError::FileTooLarge {
                path: self.path.clone(),
                size: metadata.len(),
                max_size: limits::MAX_STORE_FILE_SIZE,
            });
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| AquiloError::FileRead {
            path: self.path.clone(),
            source: e,
        })?;

        let mut document: StoredProfiles = serde_json::from_str(&contents)?;

        // Repair blank ids left by hand-edited files
        let blank: Vec<String> = document
            .profiles
            .iter()
            .filter(|(_, p)| p.id.trim().is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        if !blank.is_empty() {
            for key in blank {
                if let Some(mut profile) = document.profiles.remove(&key) {
                    profile.id = generate_profile_id();
                    debug!("Assigned id {} to profile '{}'", profile.id, profile.name);
                    document.profiles.insert(profile.id.clone(), profile);
                }
            }
            if let Err(e) = self.write_document(&document) {
                warn!("Failed to persist repaired profile ids: {}", e);
            }
        }

        Ok(document)
    }

    fn write_document(&self, document: &StoredProfiles) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(document)?;

        // Atomic write: temp file then rename
        use std::io::Write;
        let temp_path = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).map_err(|e| AquiloError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        file.write_all(json.as_bytes()).map_err(|e| AquiloError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| AquiloError::FileWrite {
            path: temp_path.clone(),
            source: e,
        })?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| AquiloError::FileWrite {
            path: self.path.clone(),
            source: e,
        })?;

        debug!("Saved {} profiles to {:?}", document.profiles.len(), self.path);
        Ok(())
    }
}

impl ProfileStore for JsonProfileStore {
    fn load(&self) -> Result<Vec<Profile>> {
        let document = self.read_document()?;
        info!("Loaded {} profiles from {:?}", document.profiles.len(), self.path);
        Ok(document.profiles.into_values().collect())
    }

    fn save(&self, profile: &Profile) -> Result<()> {
        let mut document = self.read_document().unwrap_or_else(|e| {
            warn!("Failed to load existing profiles: {}, starting fresh", e);
            StoredProfiles::new()
        });
        document.profiles.insert(profile.id.clone(), profile.clone());
        self.write_document(&document)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut document = self.read_document()?;
        let removed = document.profiles.remove(id).is_some();
        if removed {
            self.write_document(&document)?;
            info!("Deleted profile {}", id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChannelId;
    use crate::profile::{CurvePoint, ProfileKind};

    fn test_profile(id: &str) -> Profile {
        Profile {
            id: id.to_string(),
            name: "CPU Curve".to_string(),
            target_channel_id: ChannelId::new("dev0/fan1"),
            kind: ProfileKind::Curve {
                source_channel_id: ChannelId::new("dev0/temp1"),
                points: vec![
                    CurvePoint { temperature: 30.0, duty: 20.0 },
                    CurvePoint { temperature: 70.0, duty: 100.0 },
                ],
            },
        }
    }

    #[test]
    fn test_load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("profiles.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("profiles.json"));

        store.save(&test_profile("p1")).unwrap();
        store.save(&test_profile("p2")).unwrap();

        let mut loaded = store.load().unwrap();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], test_profile("p1"));
    }

    #[test]
    fn test_save_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("profiles.json"));

        store.save(&test_profile("p1")).unwrap();
        let mut updated = test_profile("p1");
        updated.name = "Renamed".to_string();
        store.save(&updated).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Renamed");
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("profiles.json"));

        store.save(&test_profile("p1")).unwrap();
        assert!(store.delete("p1").unwrap());
        assert!(!store.delete("p1").unwrap());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_oversize_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        let big = vec![b' '; (limits::MAX_STORE_FILE_SIZE + 1) as usize];
        std::fs::write(&path, big).unwrap();

        let store = JsonProfileStore::new(&path);
        assert!(matches!(
            store.load().unwrap_err(),
            AquiloError::FileTooLarge { .. }
        ));
    }
}
