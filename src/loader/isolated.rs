/// Per-game isolated loader
///
/// Bound to exactly one archive resource. Names inside the launcher's own
/// namespace are refused outright; everything else is looked up through the
/// trusted runtime first and only then in the archive, which is decoded once
/// into an in-memory table on first use.
use crate::cache::Resource;
use crate::config::settings::ArchiveLimits;
use crate::config::types::{LauncherError, Result, SandboxDenied};
use crate::loader::archive::{self, normalize_name, ArchiveTable};
use crate::loader::scratch::{ScratchKind, ScratchLedger};
use crate::observability::audit::events;
use log::{debug, info, warn};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Lookup performed before a game's own archive is consulted.
pub trait TrustedLookup: Send + Sync {
    /// `Ok(None)` when the name is unknown to the trusted runtime.
    fn lookup(&self, name: &str) -> std::result::Result<Option<Vec<u8>>, SandboxDenied>;
}

/// No trusted runtime: every name comes from the archive.
pub struct NoTrustedLookup;

impl TrustedLookup for NoTrustedLookup {
    fn lookup(&self, _name: &str) -> std::result::Result<Option<Vec<u8>>, SandboxDenied> {
        Ok(None)
    }
}

/// Files of a host-provided runtime directory.
pub struct HostRuntimeDir {
    root: PathBuf,
}

impl HostRuntimeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TrustedLookup for HostRuntimeDir {
    fn lookup(&self, name: &str) -> std::result::Result<Option<Vec<u8>>, SandboxDenied> {
        let relative = Path::new(normalize_name(name));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SandboxDenied::TrustedPath {
                name: name.to_string(),
            });
        }
        match std::fs::read(self.root.join(relative)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(_) => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedFrom {
    Trusted,
    Archive,
}

#[derive(Debug, Clone)]
pub struct LoadedEntry {
    pub name: String,
    pub bytes: Vec<u8>,
    pub origin: LoadedFrom,
}

pub struct IsolatedLoader {
    archive: Resource,
    host_namespace: String,
    trusted: Arc<dyn TrustedLookup>,
    limits: ArchiveLimits,
    table: Mutex<Option<Arc<ArchiveTable>>>,
    scratch: Mutex<ScratchLedger>,
}

impl std::fmt::Debug for IsolatedLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedLoader")
            .field("archive", &self.archive)
            .field("host_namespace", &self.host_namespace)
            .finish()
    }
}

impl IsolatedLoader {
    pub fn new(
        archive: Resource,
        host_namespace: impl Into<String>,
        trusted: Arc<dyn TrustedLookup>,
    ) -> Self {
        Self {
            archive,
            host_namespace: host_namespace.into(),
            trusted,
            limits: ArchiveLimits::default(),
            table: Mutex::new(None),
            scratch: Mutex::new(ScratchLedger::new()),
        }
    }

    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn archive(&self) -> &Resource {
        &self.archive
    }

    /// True when the first segment of `name` (split on '.' or '/') is the
    /// host namespace.
    pub fn is_host_name(&self, name: &str) -> bool {
        normalize_name(name)
            .split(['.', '/'])
            .next()
            .map(|first| first == self.host_namespace)
            .unwrap_or(false)
    }

    /// Resolve a code entry by name.
    pub fn load_entry(&self, name: &str) -> Result<LoadedEntry> {
        if self.is_host_name(name) {
            events::host_namespace_refused(self.archive.uri().as_str(), name);
            return Err(SandboxDenied::HostNamespace {
                name: name.to_string(),
            }
            .into());
        }

        match self.trusted.lookup(name) {
            Ok(Some(bytes)) => {
                return Ok(LoadedEntry {
                    name: name.to_string(),
                    bytes,
                    origin: LoadedFrom::Trusted,
                })
            }
            Ok(None) => {}
            Err(denied) => debug!("Trusted lookup refused {}: {}", name, denied),
        }

        let table = self.table()?;
        match table.get(name) {
            Some(bytes) => Ok(LoadedEntry {
                name: normalize_name(name).to_string(),
                bytes: bytes.to_vec(),
                origin: LoadedFrom::Archive,
            }),
            None => Err(LauncherError::Loader(format!(
                "{} not found in {}",
                name,
                self.archive.uri()
            ))),
        }
    }

    /// Resource bytes from the archive table only.
    pub fn read_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.table()?.get(name).map(<[u8]>::to_vec))
    }

    /// Materialize an archive entry as a tracked scratch file.
    pub fn resource_file(&self, name: &str) -> Result<Option<PathBuf>> {
        let table = self.table()?;
        let Some(bytes) = table.get(name) else {
            return Ok(None);
        };
        self.write_scratch(bytes, 0o600).map(Some)
    }

    /// Materialize the named entry as an executable scratch file.
    pub fn materialize_executable(&self, name: &str) -> Result<PathBuf> {
        let entry = self.load_entry(name)?;
        self.write_scratch(&entry.bytes, 0o700)
    }

    /// Fresh private directory the game may use as its home.
    pub fn scratch_home(&self) -> Result<PathBuf> {
        let path = self.archive.cache().scratch_file_for(&self.archive)?;
        std::fs::create_dir_all(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        self.ledger().record(ScratchKind::Directory, path.clone());
        Ok(path)
    }

    /// Decode the archive now so format errors surface before launch.
    pub fn preload(&self) -> Result<usize> {
        Ok(self.table()?.len())
    }

    pub fn entry_names(&self) -> Result<Vec<String>> {
        Ok(self.table()?.names().map(str::to_string).collect())
    }

    pub fn is_decoded(&self) -> bool {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn scratch_count(&self) -> usize {
        self.ledger().len()
    }

    /// Drop the decoded table and delete every scratch file.
    pub fn release(&self) {
        let dropped = self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        let failures = self.ledger().cleanup_all();
        if dropped || !failures.is_empty() {
            debug!(
                "Released loader for {} ({} cleanup failures)",
                self.archive,
                failures.len()
            );
        }
    }

    fn table(&self) -> Result<Arc<ArchiveTable>> {
        let mut slot = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = slot.as_ref() {
            return Ok(table.clone());
        }
        let read = self.archive.read()?;
        if read.degraded {
            warn!("Using stale copy of archive {}", self.archive);
        }
        let table = Arc::new(archive::decode(
            self.archive.uri().as_str(),
            &read.bytes,
            &self.limits,
        )?);
        info!(
            "Decoded {} ({} entries, {} bytes)",
            self.archive,
            table.len(),
            table.byte_size()
        );
        *slot = Some(table.clone());
        Ok(table)
    }

    fn write_scratch(&self, bytes: &[u8], mode: u32) -> Result<PathBuf> {
        let path = self.archive.cache().scratch_file_for(&self.archive)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.ledger().record(ScratchKind::File, path.clone());
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        Ok(path)
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, ScratchLedger> {
        self.scratch.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for IsolatedLoader {
    fn drop(&mut self) {
        self.release();
    }
}
