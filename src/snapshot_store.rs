//! One pretty-printed JSON snapshot per game config, named after the config.

use std::fs;
use std::path::{Path, PathBuf};

use crate::achievements::Snapshot;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, game: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(game)))
    }

    /// `Ok(None)` when no cache exists yet for `game`.
    pub fn load(&self, game: &str) -> Result<Option<Snapshot>> {
        let path = self.path_for(game);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write through a temp file and rename so readers never see half a snapshot.
    pub fn save(&self, game: &str, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(game);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(snapshot)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Follow a config rename. A missing source cache is not an error.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let from = self.path_for(old);
        if !from.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        fs::rename(from, self.path_for(new))?;
        Ok(())
    }

    pub fn remove(&self, game: &str) -> Result<()> {
        match fs::remove_file(self.path_for(game)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Config names are user text; keep them filesystem-safe.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let stem = stem.trim_end_matches(['.', ' ']).to_string();
    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}
