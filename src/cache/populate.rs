/// Cache prefetching
///
/// Warms the cache with every redirected URI so known-problematic origins
/// are served locally. Downloads are spaced by a fixed delay and a failure
/// never aborts the run.
use crate::cache::store::Cache;
use log::{error, info};
use std::time::Duration;

/// Pause between consecutive downloads.
pub const POPULATE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PopulateReport {
    pub fetched: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Download every redirected URI as a static resource.
pub fn populate_redirects(cache: &Cache, delay: Duration) -> PopulateReport {
    let sources: Vec<String> = cache
        .url_map()
        .redirected_sources()
        .map(str::to_string)
        .collect();
    let mut report = PopulateReport::default();

    for (i, source) in sources.iter().enumerate() {
        if i > 0 {
            std::thread::sleep(delay);
        }
        let outcome = cache
            .uri(source)
            .and_then(|uri| cache.get_resource(uri, true))
            .and_then(|resource| resource.read());
        match outcome {
            Ok(_) => {
                info!("Prefetched {}", source);
                report.fetched.push(source.clone());
            }
            Err(e) => {
                error!("Could not prefetch {}: {}", source, e);
                report.failed.push((source.clone(), e.to_string()));
            }
        }
    }
    report
}
