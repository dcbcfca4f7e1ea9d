use crate::{Result, StorageAdapter};
use std::fs;
use std::path::PathBuf;

/// File-per-key storage adapter. Writes go straight to disk so receipt
/// sets and early-arrival entries survive a crash between flush cycles.
pub struct FileStorageAdapter {
    base_path: PathBuf,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| crate::Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let sanitized = key.replace(['/', '\\', ':'], "_");
        self.base_path.join(format!("{}.json", sanitized))
    }

    fn path_to_key(file_name: &str) -> Option<String> {
        file_name
            .strip_suffix(".json")
            .map(|key| key.replace('_', "/"))
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_to_path(key);

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::Error::Storage(format!("Failed to read file: {}", e))),
        }
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_to_path(key);

        fs::write(&path, value)
            .map_err(|e| crate::Error::Storage(format!("Failed to write file: {}", e)))?;

        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::Error::Storage(format!("Failed to delete file: {}", e))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| crate::Error::Storage(format!("Failed to read directory: {}", e)))?;

        for entry in entries {
            let entry = entry
                .map_err(|e| crate::Error::Storage(format!("Failed to read dir entry: {}", e)))?;

            let file_name = entry.file_name();
            let file_name_str = file_name.to_string_lossy();

            let Some(key) = Self::path_to_key(&file_name_str) else {
                continue;
            };

            if key.starts_with(prefix) || prefix.is_empty() {
                keys.push(key);
            }
        }

        Ok(keys)
    }
}
