//! Namespace coordinator: the only owner and writer of namespace state.
//!
//! Readers get snapshots and copies; all writes go through the reducer in
//! [`crate::state`]. Network access is funnelled through the coalescing
//! fetch cache, keyed `refresh::<env>::<namespace>::<query>` for namespace
//! refreshes and `namespaces::<env>::<query>` for name discovery.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use normandy_api::{RecipeQuery, RecipeSource, SourceError, SourceResult};
use normandy_buckets::{find_occupied_buckets, Occupancy};
use normandy_core::{get_namespace_for_filter, FilterObject, Recipe, Revision, BUCKET_COUNT};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::cache::FetchCache;
use crate::state::{NamespaceAction, NamespaceState};
use crate::KEY_SEPARATOR;

const SAMPLING_TYPES: [&str; 3] = ["bucketSample", "stableSample", "namespaceSample"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("could not find room for {size} buckets in namespace {namespace:?}")]
    NoRoom { namespace: String, size: u32 },
    #[error("cannot allocate {size} buckets in namespace {namespace:?}: the space holds {}", BUCKET_COUNT)]
    TooLarge { namespace: String, size: u32 },
    #[error("auto-bucketed namespaceSample has an empty namespace")]
    UnresolvableNamespace,
    #[error(transparent)]
    Source(#[from] SourceError),
}

struct Environment {
    name: String,
    source: Arc<dyn RecipeSource>,
    state: Arc<ArcSwap<NamespaceState>>,
}

impl Environment {
    fn new(name: String, source: Arc<dyn RecipeSource>) -> Self {
        Self { name, source, state: Arc::new(ArcSwap::from_pointee(NamespaceState::default())) }
    }

    fn dispatch(&self, actions: &[NamespaceAction]) {
        self.state.rcu(|s| actions.iter().fold((**s).clone(), |acc, a| acc.reduce(a)));
    }

    fn refresh_key(&self, namespace: &str, query: &RecipeQuery) -> String {
        ["refresh", self.name.as_str(), namespace, query.as_str()].join(KEY_SEPARATOR)
    }

    fn names_key(&self, query: &RecipeQuery) -> String {
        ["namespaces", self.name.as_str(), query.as_str()].join(KEY_SEPARATOR)
    }
}

pub struct NamespaceCoordinator {
    current: ArcSwap<Environment>,
    cache: FetchCache,
    /// Serializes auto-bucketing so two drafts never pick from the same view.
    allocation: tokio::sync::Mutex<()>,
}

impl NamespaceCoordinator {
    pub fn new(environment: impl Into<String>, source: Arc<dyn RecipeSource>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Environment::new(environment.into(), source)),
            cache: FetchCache::default(),
            allocation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn environment(&self) -> String {
        self.current.load().name.clone()
    }

    /// Switch to another environment with empty state and an empty fetch
    /// cache, so a reused environment name never serves another source's
    /// results. Fetches still in flight for the previous environment land in
    /// its discarded state.
    pub fn switch_environment(&self, environment: impl Into<String>, source: Arc<dyn RecipeSource>) {
        let env = Environment::new(environment.into(), source);
        self.current.store(Arc::new(env));
        let dropped = self.cache.clear();
        info!(env = %self.current.load().name, dropped, "namespaces: environment switched");
    }

    /// Immutable view of the current environment's state.
    pub fn snapshot(&self) -> Arc<NamespaceState> {
        self.current.load().state.load_full()
    }

    pub fn is_loading(&self, segments: &[&str]) -> bool {
        self.snapshot().is_loading(segments)
    }

    pub fn namespaces(&self) -> BTreeSet<String> {
        self.snapshot().namespaces().clone()
    }

    pub fn recipes_by_namespace(&self) -> BTreeMap<String, Vec<Recipe>> {
        self.snapshot().recipes_by_namespace().clone()
    }

    /// Occupancy from the last refresh of `namespace`; no fetch is made.
    pub fn find_occupied_buckets(&self, namespace: &str) -> Occupancy {
        find_occupied_buckets(namespace, self.snapshot().recipes_in(namespace))
    }

    /// Drop completed fetches so the next refresh goes back to the source.
    pub fn invalidate(&self) {
        let dropped = self.cache.invalidate();
        info!(dropped, "namespaces: fetch cache invalidated");
    }

    /// Re-fetch every recipe that can reference `namespace` and replace its
    /// recipe list.
    pub async fn refresh(&self, namespace: &str) -> SourceResult<()> {
        let env = self.current.load_full();
        self.refresh_in(&env, namespace).await.map(|_| ())
    }

    async fn refresh_in(&self, env: &Environment, namespace: &str) -> SourceResult<Arc<NamespaceState>> {
        let t0 = Instant::now();
        let queries = [
            RecipeQuery::bucket_sample_input(namespace),
            RecipeQuery::stable_sample_input(namespace),
            RecipeQuery::namespace_sample(namespace),
        ];
        let fetches: Vec<_> = queries
            .into_iter()
            .map(|q| self.cache.fetch(env.refresh_key(namespace, &q), q, env.source.clone(), env.state.clone()))
            .collect();
        let results = futures::future::try_join_all(fetches).await?;

        let mut seen = FxHashSet::default();
        let recipes: Vec<Recipe> = results
            .iter()
            .flat_map(|batch| batch.iter())
            .filter(|r| seen.insert(r.id))
            .cloned()
            .collect();
        let count = recipes.len();
        env.dispatch(&[
            NamespaceAction::SetRecipes { namespace: namespace.to_string(), recipes },
            NamespaceAction::AddNamespaces(vec![namespace.to_string()]),
        ]);
        histogram!("namespace_refresh_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(env = %env.name, namespace = %namespace, recipes = count, took_ms = %t0.elapsed().as_millis(), "namespaces: refresh ok");
        Ok(env.state.load_full())
    }

    /// Discover namespace names across every recipe with a sampling filter.
    /// Recipe lists are not touched.
    pub async fn refresh_all_namespace_names(&self) -> SourceResult<()> {
        let env = self.current.load_full();
        let t0 = Instant::now();
        let fetches: Vec<_> = SAMPLING_TYPES
            .iter()
            .map(|kind| {
                let q = RecipeQuery::of_type(kind);
                self.cache.fetch(env.names_key(&q), q, env.source.clone(), env.state.clone())
            })
            .collect();
        let results = futures::future::try_join_all(fetches).await?;

        let names: BTreeSet<String> = results
            .iter()
            .flat_map(|batch| batch.iter())
            .flat_map(|r| r.latest_revision.sampling_filters())
            .filter_map(get_namespace_for_filter)
            .map(str::to_string)
            .collect();
        let count = names.len();
        env.dispatch(&[NamespaceAction::AddNamespaces(names.into_iter().collect())]);
        info!(env = %env.name, namespaces = count, took_ms = %t0.elapsed().as_millis(), "namespaces: names discovered");
        Ok(())
    }

    /// Lowest start of a free run of `size` buckets after refreshing
    /// `namespace`.
    ///
    /// # Panics
    ///
    /// Panics immediately, before any future is returned, if `size`
    /// exceeds [`BUCKET_COUNT`].
    pub fn find_space_in_namespace<'a>(
        &'a self,
        namespace: &'a str,
        size: u32,
    ) -> impl Future<Output = SourceResult<Option<u32>>> + Send + 'a {
        assert!(
            size <= BUCKET_COUNT,
            "requested {size} buckets in namespace {namespace:?}, space holds {BUCKET_COUNT}"
        );
        async move {
            let env = self.current.load_full();
            let state = self.refresh_in(&env, namespace).await?;
            Ok(find_occupied_buckets(namespace, state.recipes_in(namespace)).find_space(size))
        }
    }

    /// Give every `auto` namespace sample of `revision` a concrete start.
    ///
    /// Either every pending filter is placed or `revision` is left exactly as
    /// it was. Buckets claimed earlier in the same revision count as occupied
    /// for later filters.
    pub async fn resolve_auto_bucketing(&self, revision: &mut Revision) -> Result<(), AllocationError> {
        let pending = revision
            .filter_object
            .iter()
            .filter(|fo| matches!(fo, FilterObject::NamespaceSample(ns) if ns.auto))
            .count();
        if pending == 0 {
            return Ok(());
        }
        let _guard = self.allocation.lock().await;
        let env = self.current.load_full();
        let mut working = revision.filter_object.clone();
        match self.place_all(&env, &mut working).await {
            Ok(()) => {
                counter!("bucket_alloc_total", pending as u64);
                info!(env = %env.name, revision = %revision.name, placed = pending, "namespaces: auto-bucketing resolved");
                revision.filter_object = working;
                Ok(())
            }
            Err(e) => {
                counter!("bucket_alloc_failed_total", 1);
                warn!(env = %env.name, revision = %revision.name, error = %e, "namespaces: auto-bucketing failed");
                Err(e)
            }
        }
    }

    async fn place_all(&self, env: &Environment, filters: &mut [FilterObject]) -> Result<(), AllocationError> {
        let mut claimed: FxHashMap<String, Occupancy> = FxHashMap::default();
        for fo in filters.iter_mut() {
            let FilterObject::NamespaceSample(ns) = fo else { continue };
            if !ns.auto {
                continue;
            }
            if ns.namespace.is_empty() {
                return Err(AllocationError::UnresolvableNamespace);
            }
            if ns.count > BUCKET_COUNT {
                return Err(AllocationError::TooLarge { namespace: ns.namespace.clone(), size: ns.count });
            }
            if !claimed.contains_key(&ns.namespace) {
                let state = self.refresh_in(env, &ns.namespace).await?;
                let occupancy = find_occupied_buckets(&ns.namespace, state.recipes_in(&ns.namespace));
                claimed.insert(ns.namespace.clone(), occupancy);
            }
            let occupancy = claimed.entry(ns.namespace.clone()).or_default();
            let start = occupancy
                .find_space(ns.count)
                .ok_or_else(|| AllocationError::NoRoom { namespace: ns.namespace.clone(), size: ns.count })?;
            occupancy.mark(start, ns.count);
            debug!(namespace = %ns.namespace, start, count = ns.count, "namespaces: buckets claimed");
            ns.start = start;
            ns.auto = false;
        }
        Ok(())
    }
}
