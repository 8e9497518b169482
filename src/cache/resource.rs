/// Handle to one cached resource
use crate::cache::store::Cache;
use crate::config::types::{Freshness, LauncherError, Result};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use url::Url;

/// Bytes returned by a cache read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRead {
    pub bytes: Vec<u8>,
    /// The origin could not be reached and a stale copy was served.
    pub degraded: bool,
}

/// A resource is identified by its canonical URI; all state lives in the
/// cache that issued it.
#[derive(Clone)]
pub struct Resource {
    uri: Url,
    cache: Cache,
}

impl Resource {
    pub(crate) fn new(uri: Url, cache: Cache) -> Self {
        Self { uri, cache }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn read(&self) -> Result<CachedRead> {
        self.cache.read(self)
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.read()?.bytes)
    }

    pub fn read_to_string(&self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| {
            LauncherError::Loader(format!("{} is not valid UTF-8: {}", self.uri, e))
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush(self)
    }

    /// Register `uri` as a cascade child of this resource.
    pub fn child(&self, uri: Url, is_static: bool) -> Result<Resource> {
        self.cache.get_child_resource(self, uri, is_static)
    }

    pub fn freshness(&self) -> Option<Freshness> {
        self.cache.freshness(&self.uri)
    }

    pub fn is_available(&self) -> bool {
        self.cache.is_available(&self.uri)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.cache.is_up_to_date(&self.uri)
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.cache.local_path(&self.uri)
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Resource").field(&self.uri.as_str()).finish()
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.uri.as_str())
    }
}
