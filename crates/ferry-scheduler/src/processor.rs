//! Pre- and post-processing: location checks, URL mapping, and the cache layer.

use std::sync::Arc;

use ferry_core::{
    CacheState, CacheStore, MoverRegistry, TransferRequest, TransferResult, file_url, is_local,
    local_path, parse_location,
};
use tracing::{debug, info, warn};

use crate::mapping::UrlMap;

/// Runs the non-delivery stages of a request.
#[derive(Clone)]
pub struct StageProcessor {
    movers: MoverRegistry,
    cache: Option<Arc<dyn CacheStore>>,
    url_map: UrlMap,
}

impl StageProcessor {
    /// Processor resolving movers from `movers` and caching through `cache`.
    #[must_use]
    pub const fn new(movers: MoverRegistry, cache: Option<Arc<dyn CacheStore>>) -> Self {
        Self {
            movers,
            cache,
            url_map: UrlMap::new(),
        }
    }

    /// Read matching sources from mapped locations.
    #[must_use]
    pub fn with_url_map(mut self, url_map: UrlMap) -> Self {
        self.url_map = url_map;
        self
    }

    /// Validate locations, consult the cache, then the URL map.
    ///
    /// # Errors
    ///
    /// Returns a permanent error when a location is malformed or no mover
    /// handles the source scheme. Cache lookup failures only disable caching
    /// and unreachable mapped copies are ignored.
    pub async fn pre_process(&self, request: &mut TransferRequest) -> TransferResult<()> {
        parse_location(request.source())?;
        parse_location(request.destination())?;
        self.movers.resolve(request.source())?;

        self.consult_cache(request).await?;
        if request.mapped_source().is_none() {
            self.apply_url_map(request).await;
        }
        Ok(())
    }

    async fn consult_cache(&self, request: &mut TransferRequest) -> TransferResult<()> {
        let Some(cache) = self.cache.as_ref() else {
            return Ok(());
        };
        if !request.cache_parameters().is_enabled() {
            return Ok(());
        }
        if is_local(request.source()) {
            request.set_cache_state(CacheState::NonCacheable);
            return Ok(());
        }

        match cache.get(request.cache_parameters(), request.source()).await {
            Ok(Some(path)) => {
                let mapped = file_url(&path)?;
                self.movers.resolve(&mapped)?;
                debug!(request_id = %request.id(), cached = %mapped, "cache hit");
                request.set_mapped_source(mapped);
                request.set_cache_state(CacheState::AlreadyPresent);
            }
            Ok(None) => request.set_cache_state(CacheState::Cacheable),
            Err(err) => {
                warn!(request_id = %request.id(), error = %err, "cache lookup failed; transferring without cache");
                request.set_cache_state(CacheState::Skip);
            }
        }
        Ok(())
    }

    async fn apply_url_map(&self, request: &mut TransferRequest) {
        let Some(mapped) = self.url_map.map(request.source()) else {
            return;
        };
        if let Some(path) = &mapped.access_path {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                debug!(request_id = %request.id(), access = %path.display(), "mapped copy not reachable; using original source");
                return;
            }
        }
        if let Err(err) = self.movers.resolve(&mapped.location) {
            warn!(request_id = %request.id(), mapped = %mapped.location, error = %err, "no mover for mapped source");
            return;
        }
        info!(request_id = %request.id(), mapped = %mapped.location, "source is mapped");
        request.set_mapped_source(mapped.location);
    }

    /// Drop the cached copy a failed delivery read from and fall back to the
    /// original source, which is cached again once downloaded.
    pub async fn evict_cached(&self, request: &mut TransferRequest) {
        if let Some(cache) = self.cache.as_ref() {
            match cache.remove(request.cache_parameters(), request.source()).await {
                Ok(()) => info!(request_id = %request.id(), "evicted unreadable cache entry"),
                Err(err) => warn!(request_id = %request.id(), error = %err, "cache eviction failed"),
            }
        }
        request.clear_mapped_source();
        request.set_cache_state(CacheState::Cacheable);
    }

    /// Store a freshly downloaded file in the cache.
    ///
    /// # Errors
    ///
    /// Never fails the request; cache problems downgrade the cache state to
    /// `Skip`.
    pub async fn post_process(&self, request: &mut TransferRequest) -> TransferResult<()> {
        if request.cache_state() != CacheState::Cacheable {
            return Ok(());
        }
        let Some(cache) = self.cache.as_ref() else {
            return Ok(());
        };
        let stored = match local_path(request.destination()) {
            Ok(path) => cache
                .put(request.cache_parameters(), request.source(), &path)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.message().to_string()),
        };
        match stored {
            Ok(entry) => {
                debug!(request_id = %request.id(), entry = %entry.display(), "stored in cache");
                request.set_cache_state(CacheState::Downloaded);
            }
            Err(reason) => {
                warn!(request_id = %request.id(), error = %reason, "cache store failed");
                request.set_cache_state(CacheState::Skip);
            }
        }
        Ok(())
    }
}
