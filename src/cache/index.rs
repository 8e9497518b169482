/// Persisted cache index
///
/// `index.json` records every known resource, its slot file, freshness,
/// reload flag and cascade children, plus the next slot to allocate.
use crate::config::types::{Freshness, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

pub const INDEX_VERSION: &str = "1";
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub url: String,
    /// Path relative to the cache directory.
    pub local: String,
    #[serde(rename = "type")]
    pub freshness: Freshness,
    /// Needs reload on next read.
    #[serde(default)]
    pub old: bool,
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheIndex {
    pub version: String,
    /// Slot handed to the next new resource.
    pub last_file_index: u64,
    pub resources: Vec<IndexEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            last_file_index: 0,
            resources: Vec::new(),
        }
    }
}

/// Outcome of reading the index from disk
#[derive(Debug)]
pub enum IndexLoad {
    Missing,
    /// Unreadable or malformed; the caller discards it.
    Corrupt(String),
    /// Well-formed but written by an incompatible layout.
    VersionMismatch(String),
    Loaded(CacheIndex),
}

pub fn read_index(path: &Path) -> IndexLoad {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return IndexLoad::Missing,
        Err(e) => return IndexLoad::Corrupt(e.to_string()),
    };

    let value: serde_json::Value = match serde_json::from_slice(&content) {
        Ok(value) => value,
        Err(e) => return IndexLoad::Corrupt(e.to_string()),
    };

    let version = match value.get("version") {
        Some(serde_json::Value::String(v)) => v.clone(),
        Some(other) => other.to_string(),
        None => "<none>".to_string(),
    };
    if version != INDEX_VERSION {
        return IndexLoad::VersionMismatch(version);
    }

    match serde_json::from_value(value) {
        Ok(index) => IndexLoad::Loaded(index),
        Err(e) => IndexLoad::Corrupt(e.to_string()),
    }
}

/// Atomically replace the index at `dir/index.json`.
pub fn write_index(dir: &Path, index: &CacheIndex) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".index")
        .suffix(".json")
        .tempfile_in(dir)?;
    serde_json::to_writer(&mut tmp, index)?;
    tmp.flush()?;
    tmp.persist(dir.join(INDEX_FILE)).map_err(|e| e.error)?;
    Ok(())
}

/// Remove an unusable index so the next start is clean.
pub fn discard_index(path: &Path, reason: &str) {
    warn!("Discarding cache index {}: {}", path.display(), reason);
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove cache index {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_json_layout() {
        let index = CacheIndex {
            version: INDEX_VERSION.to_string(),
            last_file_index: 6,
            resources: vec![IndexEntry {
                url: "https://example.com/game.zip".to_string(),
                local: "5".to_string(),
                freshness: Freshness::Static,
                old: false,
                children: vec![],
            }],
        };
        let value = serde_json::to_value(&index).unwrap();
        assert_eq!(value["lastFileIndex"], 6);
        assert_eq!(value["resources"][0]["type"], "static");
        assert_eq!(value["resources"][0]["local"], "5");
    }

    #[test]
    fn test_read_index_classifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        assert!(matches!(read_index(&path), IndexLoad::Missing));

        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(read_index(&path), IndexLoad::Corrupt(_)));

        std::fs::write(&path, br#"{"version":"0","lastFileIndex":1,"resources":[]}"#).unwrap();
        match read_index(&path) {
            IndexLoad::VersionMismatch(v) => assert_eq!(v, "0"),
            other => panic!("unexpected {:?}", other),
        }

        write_index(dir.path(), &CacheIndex::default()).unwrap();
        assert!(matches!(read_index(&path), IndexLoad::Loaded(_)));
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        std::fs::write(&path, b"junk").unwrap();
        discard_index(&path, "test");
        assert!(!path.exists());
        discard_index(&path, "already gone");
    }
}
