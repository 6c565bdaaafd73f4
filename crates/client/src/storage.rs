//! Persistent key/value storage.
//!
//! Values are JSON files in the platform-appropriate config directory:
//! - Linux: `~/.config/scholaris/`
//! - macOS: `~/Library/Application Support/scholaris/`
//! - Windows: `%APPDATA%\scholaris\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Storage rooted in the platform config directory, created if missing.
    pub fn platform() -> Option<Self> {
        let dir = dirs::config_dir()?.join("scholaris");
        Self::at(dir)
    }

    /// Storage rooted at `dir`, created if missing.
    pub fn at(dir: impl Into<PathBuf>) -> Option<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).ok()?;
        }
        Some(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a value. Returns `true` if the write succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => std::fs::write(self.file_path(key), json).is_ok(),
            Err(_) => false,
        }
    }

    /// Load a value. `None` if the key is missing or does not deserialize.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = std::fs::read_to_string(self.file_path(key)).ok()?;
        serde_json::from_str(&json).ok()
    }

    pub fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.file_path(key));
    }

    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{}.json", safe_key))
    }
}
