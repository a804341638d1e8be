//! On-disk daemon state: the linked-id set and the running daemon's endpoint.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::AgentId;

pub const STATE_DIR_NAME: &str = ".northstar";
const LINKS_FILE: &str = "links.json";
const DAEMON_FILE: &str = "daemon.json";

#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub links: PathBuf,
    pub daemon: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            links: root.join(LINKS_FILE),
            daemon: root.join(DAEMON_FILE),
            root,
        }
    }

    /// `~/.northstar`, or `./.northstar` when there is no home directory.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(STATE_DIR_NAME)
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed creating state dir {}", self.root.display()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedLinks {
    ids: BTreeSet<AgentId>,
}

/// Persisted linked-id set.
#[derive(Debug, Clone)]
pub struct LinkStore {
    path: PathBuf,
}

impl LinkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as an empty set.
    pub fn load(&self) -> Result<BTreeSet<AgentId>> {
        if !self.path.exists() {
            return Ok(BTreeSet::new());
        }
        let links: PersistedLinks = read_json(&self.path)?;
        Ok(links.ids)
    }

    pub fn save(&self, ids: &BTreeSet<AgentId>) -> Result<()> {
        write_json_atomic(&self.path, &PersistedLinks { ids: ids.clone() })
    }

    pub fn clear(&self) -> Result<()> {
        self.save(&BTreeSet::new())
    }
}

/// Where a running daemon listens. Written on start, removed on stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub transport: String,
}

impl DaemonInfo {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("failed removing {}", path.display()))
            }
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed parsing {}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let dir = path
        .parent()
        .with_context(|| format!("state path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed creating {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed creating temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, &body).context("failed writing temp state file")?;
    tmp.persist(path)
        .with_context(|| format!("failed persisting {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> BTreeSet<AgentId> {
        raw.iter().map(|r| AgentId::new(*r).unwrap()).collect()
    }

    #[test]
    fn link_store_round_trips_and_defaults_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path().join("state"));
        let store = LinkStore::new(&paths.links);

        assert!(store.load().unwrap().is_empty());
        store.save(&ids(&[9, 2, 5])).unwrap();
        assert_eq!(store.load().unwrap(), ids(&[2, 5, 9]));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn link_store_reads_string_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.json");
        std::fs::write(&path, r#"{"ids":["3", 4]}"#).unwrap();
        assert_eq!(LinkStore::new(&path).load().unwrap(), ids(&[3, 4]));
    }

    #[test]
    fn corrupt_link_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.json");
        std::fs::write(&path, "not json").unwrap();
        let err = LinkStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("failed parsing"));
    }

    #[test]
    fn daemon_info_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let info = DaemonInfo {
            host: "127.0.0.1".into(),
            port: 7777,
            pid: 42,
            started_at: Utc::now(),
            transport: "sim".into(),
        };
        info.save(&paths.daemon).unwrap();
        assert_eq!(DaemonInfo::load(&paths.daemon).unwrap(), info);
        DaemonInfo::remove(&paths.daemon).unwrap();
        assert!(!paths.daemon.exists());
        DaemonInfo::remove(&paths.daemon).unwrap();
    }
}
