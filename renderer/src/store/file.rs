use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sstemplate::fingerprint::fingerprint;
use tempfile::NamedTempFile;

use super::{CacheStore, MAX_TTL, StoreError};

const ENTRY_EXTENSION: &str = "cache";

/// Directory-backed store: one file per key, shareable between processes.
///
/// Each file holds the expiry as Unix seconds on the first line, followed by
/// the stored content.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(fingerprint(key))
            .with_extension(ENTRY_EXTENSION)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl CacheStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.entry_path(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let (header, value) = content.split_once('\n').ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: "missing expiry header".into(),
        })?;
        let expires_at: u64 = header.trim().parse().map_err(|_| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("invalid expiry '{}'", header),
        })?;

        if expires_at <= now_unix() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(None);
        }
        Ok(Some(value.to_string()))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = now_unix().saturating_add(ttl.min(MAX_TTL).as_secs());
        let path = self.entry_path(key);
        // Every writer gets its own temp file; readers only ever see whole entries.
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        write!(tmp, "{}\n{}", expires_at, value)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
