//! Key-value backends for the token store

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::tokens::KeyValueStore;

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(key);
    }
}

/// TOML-file store, rewritten in full on every mutation.
///
/// The in-memory view is authoritative for the running process: if the file
/// cannot be written the change still applies until exit, and a warning is
/// logged.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the credentials file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Discarding unreadable credentials file: {:#}", e);
                BTreeMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> bool) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if !f(&mut guard) {
            return;
        }
        if let Err(e) = save_entries(&self.path, &guard) {
            tracing::warn!("Failed to persist credentials: {:#}", e);
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        });
    }

    fn remove(&self, key: &str) {
        self.mutate(|entries| entries.remove(key).is_some());
    }
}

fn load_entries(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(path).context("Failed to read credentials file")?;
    toml::from_str(&content).context("Failed to parse credentials file")
}

fn save_entries(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("Failed to create credentials directory")?;
    }

    let content = toml::to_string_pretty(entries).context("Failed to serialize credentials")?;

    // Tokens live in here. Written 0600 from creation and renamed over the
    // old file, whatever mode that one had.
    let staging = path.with_extension("toml.tmp");
    let _ = fs::remove_file(&staging);
    let mut file = open_private(&staging).context("Failed to create credentials file")?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.sync_all())
        .context("Failed to write credentials file")?;
    drop(file);
    fs::rename(&staging, path).context("Failed to replace credentials file")?;

    Ok(())
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}
