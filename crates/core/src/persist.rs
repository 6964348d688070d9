//! Local storage: record files and non-volatile state

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::PersistError;
use crate::time::{Epoch, Timestamp};

pub trait Persistence: Send {
    fn append_line(&mut self, path: &str, line: &str) -> Result<(), PersistError>;
}

/// Appends below a root directory, creating parent directories on demand.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Persistence for FileStore {
    fn append_line(&mut self, path: &str, line: &str) -> Result<(), PersistError> {
        let full = self.path_of(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&full)?;
        writeln!(file, "{}", line)?;
        debug!("appended {} bytes to {}", line.len() + 1, full.display());
        Ok(())
    }
}

/// In-memory store, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    lines: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn lines_in(&self, path: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(p, _)| p == path)
            .map(|(_, l)| l)
            .collect()
    }
}

impl Persistence for MemoryStore {
    fn append_line(&mut self, path: &str, line: &str) -> Result<(), PersistError> {
        let mut lines = self
            .lines
            .lock()
            .map_err(|_| std::io::Error::other("memory store poisoned"))?;
        lines.push((path.to_string(), line.to_string()));
        Ok(())
    }
}

/// Fills `{ID}`, `{YMD}`, `{Y}`, `{M}` and `{D}` in a file name template.
pub fn expand_template(template: &str, id: &str, ts: &Timestamp) -> String {
    template
        .replace("{ID}", id)
        .replace("{YMD}", &ts.ymd())
        .replace("{Y}", &format!("{:04}", ts.year))
        .replace("{M}", &format!("{:02}", ts.month))
        .replace("{D}", &format!("{:02}", ts.day))
}

/// State that survives power cuts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvState {
    /// Last armed wake. Tells early wakes apart and may restore a cold clock.
    pub wake_hint: Option<Epoch>,
    pub next_packet_id: u8,
    pub low_battery_ack: bool,
}

#[derive(Debug, Clone)]
pub struct NvStore {
    path: PathBuf,
}

impl NvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state falls back to defaults.
    pub fn load(&self) -> NvState {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return NvState::default(),
        };
        match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((state, _)) => state,
            Err(e) => {
                warn!("discarding corrupt state at {}: {}", self.path.display(), e);
                NvState::default()
            }
        }
    }

    pub fn save(&self, state: &NvState) -> Result<(), PersistError> {
        let bytes = bincode::serde::encode_to_vec(state, bincode::config::standard())?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}
