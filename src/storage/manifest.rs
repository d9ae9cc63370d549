//! `manifest.json`: an advisory hint file, not load-bearing for recovery.
//!
//! The on-disk segment layout is the source of truth; this file
//! only short-circuits a cold start by recording the retention window and
//! which hour was last written, so the store doesn't have to walk every
//! partition directory just to find the newest one.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub retention_secs: u64,
    pub last_seen_hour: Option<String>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = Manifest {
            retention_secs: 3600 * 24 * 7,
            last_seen_hour: Some("2026/07/27/14".to_string()),
        };
        manifest.save(&path).unwrap();
        let loaded = Manifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.retention_secs, manifest.retention_secs);
        assert_eq!(loaded.last_seen_hour, manifest.last_seen_hour);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.json");
        assert!(Manifest::load(&path).unwrap().is_none());
    }
}
