/// The resource cache service
///
/// Maps remote URIs to slot files under one cache directory. A `Cache` is a
/// cheap handle over shared state; construct one at startup and pass it to
/// every collaborator that reads remote bytes.
use crate::cache::fetch::{copy_local, Fetcher};
use crate::cache::index::{
    discard_index, read_index, write_index, CacheIndex, IndexEntry, IndexLoad, INDEX_FILE,
    INDEX_VERSION,
};
use crate::cache::lock::{CacheLock, LOCK_FILE};
use crate::cache::resource::{CachedRead, Resource};
use crate::config::types::{FetchError, Freshness, LauncherError, Result};
use crate::config::url_map::UrlMap;
use crate::observability::audit::events;
use crate::utils::thread_role::is_presentation_thread;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use url::Url;

/// Directory holding materialized scratch files.
pub const SCRATCH_DIR: &str = "resource";

/// Asked whether an incompatible cache may be wiped.
pub trait CacheInvalidationPrompt: Send + Sync {
    fn confirm_clear(&self, found_version: &str) -> bool;
}

/// Wipes without asking. Used by non-interactive front ends.
pub struct AlwaysClear;

impl CacheInvalidationPrompt for AlwaysClear {
    fn confirm_clear(&self, found_version: &str) -> bool {
        warn!(
            "Cache index version {} is incompatible with {}; clearing cache",
            found_version, INDEX_VERSION
        );
        true
    }
}

/// Notified after a resource's bytes were (re)downloaded.
pub trait ResourceListener: Send + Sync {
    fn resource_loaded(&self, resource: &Resource);
}

pub struct CacheOptions {
    pub dir: PathBuf,
    pub url_map: UrlMap,
    pub fetcher: Arc<dyn Fetcher>,
    pub prompt: Arc<dyn CacheInvalidationPrompt>,
    /// Hold an exclusive lock on the directory while open.
    pub lock: bool,
}

impl CacheOptions {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            dir: dir.into(),
            url_map: UrlMap::default(),
            fetcher,
            prompt: Arc::new(AlwaysClear),
            lock: true,
        }
    }

    pub fn with_url_map(mut self, url_map: UrlMap) -> Self {
        self.url_map = url_map;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn CacheInvalidationPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn without_lock(mut self) -> Self {
        self.lock = false;
        self
    }
}

/// Snapshot of one index entry, for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub uri: Url,
    pub local: PathBuf,
    pub freshness: Freshness,
    pub needs_reload: bool,
    pub available: bool,
    pub children: Vec<Url>,
}

#[derive(Debug, Clone)]
struct Entry {
    local: String,
    freshness: Freshness,
    needs_reload: bool,
    children: BTreeSet<Url>,
}

#[derive(Debug, Default)]
struct State {
    next_slot: u64,
    entries: HashMap<Url, Entry>,
}

/// Origin hosts already warned about this session
#[derive(Debug, Default)]
pub struct DegradedNotices {
    hosts: Mutex<HashSet<String>>,
}

impl DegradedNotices {
    /// True the first time `host` is seen.
    pub fn first_for(&self, host: &str) -> bool {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.insert(host.to_string())
    }
}

struct Inner {
    dir: PathBuf,
    url_map: UrlMap,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<State>,
    listeners: RwLock<Vec<Arc<dyn ResourceListener>>>,
    degraded: DegradedNotices,
    in_flight: Mutex<HashSet<Url>>,
    in_flight_done: Condvar,
    scratch_seq: AtomicU64,
    _lock: Option<CacheLock>,
}

#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("dir", &self.inner.dir).finish()
    }
}

/// Removes a URL from the in-flight set when a download ends.
struct InFlight<'a> {
    inner: &'a Inner,
    url: Url,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.url);
        self.inner.in_flight_done.notify_all();
    }
}

impl Cache {
    /// Open (or create) the cache directory and load its index.
    pub fn open(options: CacheOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.dir).map_err(|e| {
            LauncherError::Config(format!(
                "Could not create cache directory {}: {}",
                options.dir.display(),
                e
            ))
        })?;

        let lock = if options.lock {
            Some(CacheLock::acquire(&options.dir)?)
        } else {
            None
        };

        let index_path = options.dir.join(INDEX_FILE);
        let state = match read_index(&index_path) {
            IndexLoad::Missing => State::default(),
            IndexLoad::Corrupt(reason) => {
                discard_index(&index_path, &reason);
                State::default()
            }
            IndexLoad::VersionMismatch(found) => {
                if !options.prompt.confirm_clear(&found) {
                    return Err(LauncherError::IncompatibleCacheIndex {
                        found,
                        expected: INDEX_VERSION.to_string(),
                    });
                }
                let removed = clear_directory(&options.dir)?;
                events::cache_cleared(removed);
                State::default()
            }
            IndexLoad::Loaded(index) => state_from_index(index, &options.url_map),
        };

        info!(
            "Opened cache {} ({} resources, next slot {:x})",
            options.dir.display(),
            state.entries.len(),
            state.next_slot
        );

        let cache = Self {
            inner: Arc::new(Inner {
                dir: options.dir,
                url_map: options.url_map,
                fetcher: options.fetcher,
                state: Mutex::new(state),
                listeners: RwLock::new(Vec::new()),
                degraded: DegradedNotices::default(),
                in_flight: Mutex::new(HashSet::new()),
                in_flight_done: Condvar::new(),
                scratch_seq: AtomicU64::new(0),
                _lock: lock,
            }),
        };
        if !index_path.exists() {
            let state = cache.lock_state();
            cache.persist(&state)?;
        }
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn url_map(&self) -> &UrlMap {
        &self.inner.url_map
    }

    /// Parse a textual URI through the redirection table.
    pub fn uri(&self, uri: &str) -> Result<Url> {
        self.inner.url_map.resolve(uri)
    }

    pub fn add_listener(&self, listener: Arc<dyn ResourceListener>) {
        let mut listeners = self.inner.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    /// Look up or create the resource for `url`.
    ///
    /// A new resource takes the next slot and the index is rewritten
    /// before this returns. `file:` URIs are always local-static.
    pub fn get_resource(&self, url: Url, is_static: bool) -> Result<Resource> {
        let mut state = self.lock_state();
        if Self::ensure_entry(&mut state, &url, is_static) {
            self.persist(&state)?;
        }
        drop(state);
        Ok(Resource::new(url, self.clone()))
    }

    /// Like [`get_resource`](Self::get_resource), and also registers
    /// `url` as a cascade child of `parent`.
    pub fn get_child_resource(&self, parent: &Resource, url: Url, is_static: bool) -> Result<Resource> {
        let mut state = self.lock_state();
        let mut changed = Self::ensure_entry(&mut state, &url, is_static);
        match state.entries.get_mut(parent.uri()) {
            Some(entry) => changed |= entry.children.insert(url.clone()),
            None => {
                return Err(LauncherError::InvalidState(format!(
                    "parent {} is not in the cache",
                    parent.uri()
                )))
            }
        }
        if changed {
            self.persist(&state)?;
        }
        drop(state);
        Ok(Resource::new(url, self.clone()))
    }

    /// Existing resource for `url`, if any.
    pub fn lookup(&self, url: &Url) -> Option<Resource> {
        let state = self.lock_state();
        state
            .entries
            .contains_key(url)
            .then(|| Resource::new(url.clone(), self.clone()))
    }

    /// Read a resource's bytes, downloading when required.
    pub fn read(&self, resource: &Resource) -> Result<CachedRead> {
        let url = resource.uri();
        if is_presentation_thread() {
            error!("Cache read of {} on the presentation thread", url);
            return Err(LauncherError::PresentationThreadRead(url.to_string()));
        }

        let (freshness, local) = {
            let state = self.lock_state();
            let entry = self.entry(&state, url)?;
            (entry.freshness, self.inner.dir.join(&entry.local))
        };

        if freshness == Freshness::LocalStatic {
            let mut bytes = Vec::new();
            return match copy_local(url, &mut bytes) {
                Ok(_) => Ok(CachedRead {
                    bytes,
                    degraded: false,
                }),
                Err(e) => Err(LauncherError::CacheUnavailable {
                    uri: url.to_string(),
                    reason: e.to_string(),
                }),
            };
        }

        let fetched = match self.download(url) {
            Ok(()) => None,
            Err(e) => Some(e),
        };

        match std::fs::read(&local) {
            Ok(bytes) => {
                let degraded = fetched.is_some();
                if let Some(e) = fetched {
                    self.note_degraded(url, &e);
                }
                Ok(CachedRead { bytes, degraded })
            }
            Err(read_err) => Err(LauncherError::CacheUnavailable {
                uri: url.to_string(),
                reason: match fetched {
                    Some(e) => e.to_string(),
                    None => read_err.to_string(),
                },
            }),
        }
    }

    /// Mark `resource` and every transitively registered child as needing
    /// reload. Cached bytes stay on disk as a fallback.
    pub fn flush(&self, resource: &Resource) -> Result<()> {
        let mut state = self.lock_state();
        let mut queue = VecDeque::from([resource.uri().clone()]);
        let mut seen = HashSet::new();
        let mut changed = false;
        while let Some(url) = queue.pop_front() {
            if !seen.insert(url.clone()) {
                continue;
            }
            if let Some(entry) = state.entries.get_mut(&url) {
                if !entry.needs_reload {
                    entry.needs_reload = true;
                    changed = true;
                }
                queue.extend(entry.children.iter().cloned());
            }
        }
        debug!("Flushed {} ({} resources)", resource.uri(), seen.len());
        if changed {
            self.persist(&state)?;
        }
        Ok(())
    }

    pub fn freshness(&self, url: &Url) -> Option<Freshness> {
        self.lock_state().entries.get(url).map(|e| e.freshness)
    }

    pub fn needs_reload(&self, url: &Url) -> bool {
        self.lock_state()
            .entries
            .get(url)
            .map(|e| e.needs_reload)
            .unwrap_or(true)
    }

    /// Where the bytes for `url` live: the slot file, or the file itself
    /// for local-static resources.
    pub fn local_path(&self, url: &Url) -> Option<PathBuf> {
        let state = self.lock_state();
        let entry = state.entries.get(url)?;
        if entry.freshness == Freshness::LocalStatic {
            url.to_file_path().ok()
        } else {
            Some(self.inner.dir.join(&entry.local))
        }
    }

    pub fn is_available(&self, url: &Url) -> bool {
        self.local_path(url).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn is_up_to_date(&self, url: &Url) -> bool {
        self.is_available(url) && !self.needs_reload(url)
    }

    /// Children registered under `url`.
    pub fn children(&self, url: &Url) -> Vec<Url> {
        self.lock_state()
            .entries
            .get(url)
            .map(|e| e.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let state = self.lock_state();
        let mut out: Vec<CacheEntryInfo> = state
            .entries
            .iter()
            .map(|(url, entry)| {
                let local = self.inner.dir.join(&entry.local);
                CacheEntryInfo {
                    uri: url.clone(),
                    available: if entry.freshness == Freshness::LocalStatic {
                        url.to_file_path().map(|p| p.is_file()).unwrap_or(false)
                    } else {
                        local.is_file()
                    },
                    local,
                    freshness: entry.freshness,
                    needs_reload: entry.needs_reload,
                    children: entry.children.iter().cloned().collect(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.uri.as_str().cmp(b.uri.as_str()));
        out
    }

    /// Slot counter that the next new resource will take.
    pub fn next_slot(&self) -> u64 {
        self.lock_state().next_slot
    }

    /// Delete every cached file and start a fresh index.
    pub fn clear(&self) -> Result<usize> {
        let mut state = self.lock_state();
        let removed = clear_directory(&self.inner.dir)?;
        *state = State::default();
        self.persist(&state)?;
        events::cache_cleared(removed);
        Ok(removed)
    }

    /// A fresh scratch path under `<cache>/resource/` derived from the
    /// resource's slot. The caller owns and deletes the file.
    pub fn scratch_file_for(&self, resource: &Resource) -> Result<PathBuf> {
        let slot = {
            let state = self.lock_state();
            self.entry(&state, resource.uri())?.local.clone()
        };
        let dir = self.inner.dir.join(SCRATCH_DIR);
        std::fs::create_dir_all(&dir)?;
        loop {
            let n = self.inner.scratch_seq.fetch_add(1, Ordering::Relaxed);
            let candidate = dir.join(format!("{}.tmp.{}", slot, n));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry<'s>(&self, state: &'s State, url: &Url) -> Result<&'s Entry> {
        state.entries.get(url).ok_or_else(|| {
            LauncherError::InvalidState(format!("{} is not in the cache", url))
        })
    }

    /// Returns true when a new entry was allocated.
    fn ensure_entry(state: &mut State, url: &Url, is_static: bool) -> bool {
        if state.entries.contains_key(url) {
            return false;
        }
        let freshness = if url.scheme() == "file" {
            Freshness::LocalStatic
        } else if is_static {
            Freshness::Static
        } else {
            Freshness::Volatile
        };
        let local = format!("{:x}", state.next_slot);
        state.next_slot += 1;
        debug!("Allocated slot {} for {} ({})", local, url, freshness.as_str());
        state.entries.insert(
            url.clone(),
            Entry {
                local,
                freshness,
                needs_reload: false,
                children: BTreeSet::new(),
            },
        );
        true
    }

    fn persist(&self, state: &State) -> Result<()> {
        let mut resources: Vec<IndexEntry> = state
            .entries
            .iter()
            .map(|(url, entry)| IndexEntry {
                url: url.to_string(),
                local: entry.local.clone(),
                freshness: entry.freshness,
                old: entry.needs_reload,
                children: entry.children.iter().map(Url::to_string).collect(),
            })
            .collect();
        resources.sort_by(|a, b| a.url.cmp(&b.url));
        let index = CacheIndex {
            version: INDEX_VERSION.to_string(),
            last_file_index: state.next_slot,
            resources,
        };
        write_index(&self.inner.dir, &index).map_err(|e| {
            error!("Failed to persist cache index: {}", e);
            e
        })
    }

    /// Bring the slot file up to date, or leave it untouched on failure.
    fn download(&self, url: &Url) -> std::result::Result<(), FetchError> {
        let _guard = self.begin_download(url);

        let local = {
            let state = self.lock_state();
            let Some(entry) = state.entries.get(url) else {
                return Err(FetchError::UnsupportedScheme(url.to_string()));
            };
            let local = self.inner.dir.join(&entry.local);
            // Static copies are served as-is until flushed.
            if entry.freshness == Freshness::Static && !entry.needs_reload && local.is_file() {
                return Ok(());
            }
            local
        };

        debug!("Downloading {} into {}", url, local.display());
        let result = (|| {
            let mut tmp = tempfile::Builder::new()
                .prefix(".download")
                .tempfile_in(&self.inner.dir)?;
            self.inner.fetcher.fetch(url, &mut tmp)?;
            tmp.flush()?;
            tmp.persist(&local).map_err(|e| FetchError::Io(e.error))?;
            Ok::<(), FetchError>(())
        })();

        let mut state = self.lock_state();
        let Some(entry) = state.entries.get_mut(url) else {
            return result;
        };
        let was = entry.needs_reload;
        entry.needs_reload = result.is_err();
        if was != entry.needs_reload {
            if let Err(e) = self.persist(&state) {
                warn!("Index not updated after download of {}: {}", url, e);
            }
        }
        drop(state);

        if result.is_ok() {
            self.notify_loaded(url);
        }
        result
    }

    fn begin_download(&self, url: &Url) -> InFlight<'_> {
        let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while set.contains(url) {
            set = self
                .inner
                .in_flight_done
                .wait(set)
                .unwrap_or_else(|e| e.into_inner());
        }
        set.insert(url.clone());
        InFlight {
            inner: &self.inner,
            url: url.clone(),
        }
    }

    fn notify_loaded(&self, url: &Url) {
        let listeners: Vec<_> = {
            let listeners = self.inner.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners.clone()
        };
        if listeners.is_empty() {
            return;
        }
        let resource = Resource::new(url.clone(), self.clone());
        for listener in listeners {
            listener.resource_loaded(&resource);
        }
    }

    fn note_degraded(&self, url: &Url, cause: &FetchError) {
        let host = url.host_str().unwrap_or("<local>");
        if self.inner.degraded.first_for(host) {
            warn!("Serving stale copy of {} ({})", url, cause);
            events::cache_degraded(url.as_str(), host);
        } else {
            debug!("Serving stale copy of {} ({})", url, cause);
        }
    }
}

fn state_from_index(index: CacheIndex, url_map: &UrlMap) -> State {
    let mut entries = HashMap::new();
    for entry in index.resources {
        let url = match url_map.resolve(&entry.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Dropping cache entry {}: {}", entry.url, e);
                continue;
            }
        };
        let children = entry
            .children
            .iter()
            .filter_map(|child| url_map.resolve(child).ok())
            .collect();
        entries.insert(
            url,
            Entry {
                local: entry.local,
                freshness: entry.freshness,
                needs_reload: entry.old,
                children,
            },
        );
    }
    State {
        next_slot: index.last_file_index,
        entries,
    }
}

/// Remove every regular file in the cache directory and its scratch
/// directory, keeping the lock file.
fn clear_directory(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for target in [dir.to_path_buf(), dir.join(SCRATCH_DIR)] {
        let entries = match std::fs::read_dir(&target) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name() == LOCK_FILE || !entry.file_type()?.is_file() {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not delete {}: {}", entry.path().display(), e),
            }
        }
    }
    Ok(removed)
}
