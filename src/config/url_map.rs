/// URI redirection table applied before a URI becomes a cache identity
use crate::config::settings::UrlMapSettings;
use crate::config::types::{LauncherError, Result};
use log::warn;
use std::collections::BTreeMap;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct UrlMap {
    redirects: BTreeMap<String, Url>,
}

impl UrlMap {
    /// Build the table, substituting `${key}` placeholders in both sides.
    /// Entries whose target is not a valid URI are skipped with a warning.
    pub fn from_settings(settings: &UrlMapSettings) -> Self {
        let mut redirects = BTreeMap::new();
        for (i, redirect) in settings.redirects.iter().enumerate() {
            let source = substitute(&redirect.source, &settings.properties);
            let target = substitute(&redirect.target, &settings.properties);
            match Url::parse(&target) {
                Ok(url) => {
                    redirects.insert(source, url);
                }
                Err(e) => warn!(
                    "Redirect {} has invalid target {} ({}): {}",
                    i, redirect.target, target, e
                ),
            }
        }
        Self { redirects }
    }

    /// Resolve a textual URI, honouring redirections.
    pub fn resolve(&self, uri: &str) -> Result<Url> {
        if let Some(target) = self.redirects.get(uri) {
            return Ok(target.clone());
        }
        Url::parse(uri).map_err(|e| LauncherError::Config(format!("invalid URI {}: {}", uri, e)))
    }

    /// Sources of every configured redirection.
    pub fn redirected_sources(&self) -> impl Iterator<Item = &str> {
        self.redirects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.redirects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redirects.is_empty()
    }
}

fn substitute(value: &str, properties: &BTreeMap<String, String>) -> String {
    let mut out = value.to_string();
    for (key, replacement) in properties {
        let placeholder = format!("${{{}}}", key);
        out = out.replace(&placeholder, replacement);
    }
    out
}
