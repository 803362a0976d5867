use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tempfile::NamedTempFile;

/// The key/value area both execution contexts can reach. Implementations
/// must not cache: every read observes the latest write from either side.
pub trait SharedArea: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Value>>;
    fn write(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Directory shared between processes (an app-group container on device).
/// Each key lives in its own JSON file, so writers touching different keys
/// never overwrite each other. Every write goes to a uniquely named staging
/// file in the same directory and is renamed over the key's file.
pub struct FileSharedArea {
    dir: PathBuf,
}

impl FileSharedArea {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create shared area directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

/// Keys carry `:` separators; keep file names portable.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

impl SharedArea for FileSharedArea {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        let path = self.key_path(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read shared value {}", path.display()))
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .with_context(|| format!("Shared value at {} is corrupt", path.display()))
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        let path = self.key_path(key);
        let mut staging = NamedTempFile::new_in(&self.dir).with_context(|| {
            format!("Failed to stage shared value in {}", self.dir.display())
        })?;
        serde_json::to_writer(&mut staging, &value)?;
        staging.flush()?;
        staging
            .persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("Failed to replace shared value at {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to remove shared value {}", path.display())),
        }
    }
}

/// In-process area for embedding both contexts in one process and for tests.
#[derive(Clone, Default)]
pub struct MemorySharedArea {
    data: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemorySharedArea {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedArea for MemorySharedArea {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        let guard = self
            .data
            .lock()
            .map_err(|_| anyhow!("shared area lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| anyhow!("shared area lock poisoned"))?;
        guard.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| anyhow!("shared area lock poisoned"))?;
        guard.remove(key);
        Ok(())
    }
}
