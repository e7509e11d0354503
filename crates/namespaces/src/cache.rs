//! Coalescing cache over recipe fetches.
//!
//! Each distinct key maps to one shared future. The entry is inserted and
//! the key marked as loading under a single lock, so concurrent callers
//! either create the fetch or join it; there is no window where both miss.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use normandy_api::{RecipeQuery, RecipeSource, SourceResult};
use normandy_core::Recipe;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::state::{NamespaceAction, NamespaceState};

pub(crate) type SharedFetch = Shared<BoxFuture<'static, SourceResult<Arc<Vec<Recipe>>>>>;

/// Cached fetch tagged with the generation that created it, so a fetch
/// dropped by [`FetchCache::clear`] never evicts its replacement.
struct Entry {
    generation: u64,
    fut: SharedFetch,
}

type Entries = Mutex<FxHashMap<String, Entry>>;

#[derive(Default)]
pub(crate) struct FetchCache {
    entries: Arc<Entries>,
    generation: AtomicU64,
}

impl FetchCache {
    /// Shared fetch for `key`, starting it against `source` on first use.
    /// Loading flags are recorded in `state`. Must be called from within a
    /// tokio runtime.
    pub(crate) fn fetch(
        &self,
        key: String,
        query: RecipeQuery,
        source: Arc<dyn RecipeSource>,
        state: Arc<ArcSwap<NamespaceState>>,
    ) -> SharedFetch {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            counter!("namespace_fetch_coalesced_total", 1);
            debug!(key = %key, "fetch: joined existing request");
            return existing.fut.clone();
        }

        state.rcu(|s| s.reduce(&NamespaceAction::StartLoading(key.clone())));
        counter!("namespace_fetch_total", 1);
        debug!(key = %key, "fetch: start");

        let evict_from = Arc::downgrade(&self.entries);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let fetch_key = key.clone();
        let fut = async move {
            let t0 = Instant::now();
            let res = source.fetch_recipes(&query).await.map(Arc::new);
            state.rcu(|s| s.reduce(&NamespaceAction::FinishLoading(fetch_key.clone())));
            match &res {
                Ok(recipes) => {
                    debug!(key = %fetch_key, recipes = recipes.len(), took_ms = %t0.elapsed().as_millis(), "fetch: ok");
                }
                Err(e) => {
                    counter!("namespace_fetch_failed_total", 1);
                    warn!(key = %fetch_key, error = %e, took_ms = %t0.elapsed().as_millis(), "fetch: failed; evicting");
                    if let Some(entries) = evict_from.upgrade() {
                        let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
                        if entries.get(&fetch_key).map(|e| e.generation) == Some(generation) {
                            entries.remove(&fetch_key);
                        }
                    }
                }
            }
            res
        }
        .boxed()
        .shared();

        // Driven to completion even if every caller stops polling.
        tokio::spawn(fut.clone().map(|_| ()));
        entries.insert(key, Entry { generation, fut: fut.clone() });
        fut
    }

    /// Drop completed entries. In-flight fetches stay so their waiters keep
    /// sharing them. Returns the number of entries dropped.
    pub(crate) fn invalidate(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.fut.peek().is_none());
        before - entries.len()
    }

    /// Forget every entry, in flight or not. Fetches already started still
    /// run to completion for their current waiters.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
