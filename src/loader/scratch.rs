/// Ledger of scratch files materialized for one game
///
/// Entries are recorded right after creation and removed in reverse order.
/// Cleanup is idempotent: a failed removal stays in the ledger for the next
/// attempt.
use log::{debug, warn};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct ScratchEntry {
    pub kind: ScratchKind,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct ScratchLedger {
    entries: Vec<ScratchEntry>,
}

impl ScratchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ScratchKind, path: PathBuf) {
        debug!("Recording scratch {:?} {}", kind, path.display());
        self.entries.push(ScratchEntry { kind, path });
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything recorded, newest first. Returns the failures.
    pub fn cleanup_all(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        let mut remaining = Vec::new();

        while let Some(entry) = self.entries.pop() {
            let outcome = match entry.kind {
                ScratchKind::File => std::fs::remove_file(&entry.path),
                ScratchKind::Directory => std::fs::remove_dir_all(&entry.path),
            };
            match outcome {
                Ok(()) => debug!("Removed scratch {}", entry.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    let msg = format!("Failed to remove {}: {}", entry.path.display(), e);
                    warn!("{}", msg);
                    failures.push(msg);
                    remaining.push(entry);
                }
            }
        }

        remaining.reverse();
        self.entries = remaining;
        failures
    }
}
