//! Local advisory cache on disk.
//!
//! Two JSON documents live under the cache root: the boards this client owns
//! and the slug resolution map. Both are best effort. A missing or corrupt file
//! reads as empty and a failed write is logged, never surfaced, so callers
//! always fall back to the relays.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::BoardConfig;

const BOARDS_FILE: &str = "boards.json";
const SLUGS_FILE: &str = "slug-cache.json";

/// Board owned by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBoard {
    pub board_id: String,
    pub config: BoardConfig,
    /// Time the board was created locally, Unix seconds.
    pub created_at: u64,
    /// Secret of the one-time key that signs the config of a board not tied
    /// to the user identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_key: Option<String>,
}

/// File-backed cache rooted at `root`.
#[derive(Clone)]
pub struct Cache {
    root: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Arc<Mutex<()>>,
}

impl Cache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Boards this client created, oldest first.
    pub fn boards(&self) -> Vec<StoredBoard> {
        self.read(BOARDS_FILE)
    }

    pub fn board(&self, board_id: &str) -> Option<StoredBoard> {
        self.boards().into_iter().find(|b| b.board_id == board_id)
    }

    /// Insert or replace the entry for `board.board_id`.
    pub fn put_board(&self, board: StoredBoard) {
        let _g = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut boards: Vec<StoredBoard> = self.read(BOARDS_FILE);
        match boards.iter_mut().find(|b| b.board_id == board.board_id) {
            Some(existing) => *existing = board,
            None => boards.push(board),
        }
        self.write(BOARDS_FILE, &boards);
    }

    /// Cached board id for `slug`.
    pub fn slug(&self, slug: &str) -> Option<String> {
        let map: BTreeMap<String, String> = self.read(SLUGS_FILE);
        map.get(slug).filter(|b| !b.is_empty()).cloned()
    }

    pub fn put_slug(&self, slug: &str, board_id: &str) {
        let _g = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut map: BTreeMap<String, String> = self.read(SLUGS_FILE);
        map.insert(slug.to_string(), board_id.to_string());
        self.write(SLUGS_FILE, &map);
    }

    /// Forget every cached slug resolution.
    pub fn clear_slugs(&self) {
        let _g = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.root.join(SLUGS_FILE);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "slug cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to clear slug cache")
            }
        }
    }

    fn read<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.root.join(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => return T::default(),
        };
        serde_json::from_slice(&data).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt cache file");
            T::default()
        })
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) {
        if let Err(e) = self.try_write(name, value) {
            tracing::warn!(file = name, error = %e, "cache write failed");
        }
    }

    fn try_write<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        serde_json::to_writer(&tmp, value)?;
        tmp.persist(self.root.join(name))?;
        Ok(())
    }
}
