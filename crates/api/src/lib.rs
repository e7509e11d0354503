//! Recipe source capability.
//!
//! The namespace coordinator only ever asks one question of the outside
//! world: "which recipes carry a filter object matching this query?". This
//! crate defines that seam ([`RecipeSource`]), its query descriptor and error
//! type, plus two in-process implementations: [`MockSource`] for tests and
//! [`JsonFileSource`] over a recipe dump on disk.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use normandy_core::{quoted_literal_body, FilterObject, Recipe};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Source errors. `Clone` so one failed fetch can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SourceError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Filter-object query: a comma separated `key:value` list such as
/// `type:namespaceSample,namespace:search`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeQuery {
    pub filter_object_query: String,
}

impl RecipeQuery {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let filter_object_query = pairs
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",");
        Self { filter_object_query }
    }

    pub fn of_type(kind: &str) -> Self {
        Self::from_pairs([("type", kind)])
    }

    pub fn bucket_sample_input(namespace: &str) -> Self {
        Self::from_pairs([("type", "bucketSample"), ("input", namespace)])
    }

    pub fn stable_sample_input(namespace: &str) -> Self {
        Self::from_pairs([("type", "stableSample"), ("input", namespace)])
    }

    pub fn namespace_sample(namespace: &str) -> Self {
        Self::from_pairs([("type", "namespaceSample"), ("namespace", namespace)])
    }

    pub fn as_str(&self) -> &str {
        &self.filter_object_query
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.filter_object_query
            .split(',')
            .filter(|p| !p.is_empty())
            .map(|p| p.split_once(':').unwrap_or((p, "")))
    }

    /// Whether a single filter object satisfies every pair of the query.
    pub fn matches_filter(&self, fo: &FilterObject) -> bool {
        self.pairs().all(|(key, value)| match key {
            "type" => fo.kind() == value,
            "namespace" => match fo {
                FilterObject::NamespaceSample(ns) => ns.namespace == value,
                FilterObject::Malformed(m) => m.raw.get("namespace").and_then(Value::as_str) == Some(value),
                _ => false,
            },
            "input" => {
                let matches_input = |s: &str| s == value || quoted_literal_body(s) == Some(value);
                match fo {
                    FilterObject::BucketSample(b) => b.input.iter().filter_map(Value::as_str).any(matches_input),
                    FilterObject::StableSample(s) => s.input.iter().filter_map(Value::as_str).any(matches_input),
                    FilterObject::Malformed(m) => m.input_strings().any(matches_input),
                    _ => false,
                }
            }
            _ => false,
        })
    }

    /// Whether any filter object of the recipe's latest revision matches.
    pub fn matches(&self, recipe: &Recipe) -> bool {
        recipe.latest_revision.filter_object.iter().any(|fo| self.matches_filter(fo))
    }
}

impl std::fmt::Display for RecipeQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.filter_object_query)
    }
}

/// Fetch recipes whose filter objects match a query.
#[async_trait::async_trait]
pub trait RecipeSource: Send + Sync {
    async fn fetch_recipes(&self, query: &RecipeQuery) -> SourceResult<Vec<Recipe>>;
}

// ----------------- Mock implementation -----------------

/// In-memory source for tests. Counts calls per query and can simulate
/// latency or failures, or hold every fetch until a gate is notified.
#[derive(Default)]
pub struct MockSource {
    recipes: Mutex<Vec<Recipe>>,
    latency: Option<Duration>,
    gate: Option<Arc<Notify>>,
    failure: Mutex<Option<SourceError>>,
    calls: Mutex<FxHashMap<String, usize>>,
}

impl MockSource {
    pub fn new(recipes: Vec<Recipe>) -> Self {
        Self { recipes: Mutex::new(recipes), ..Self::default() }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Hold each fetch until `gate` releases it. A fetch is registered with
    /// the gate before it is counted, so once [`Self::calls_for`] sees it,
    /// `notify_waiters` is guaranteed to release it.
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_recipes(&self, recipes: Vec<Recipe>) {
        *self.recipes.lock().unwrap_or_else(PoisonError::into_inner) = recipes;
    }

    /// Fail every fetch with `err` until cleared with `None`.
    pub fn set_failure(&self, err: Option<SourceError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    pub fn calls_for(&self, query: &RecipeQuery) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(query.as_str()).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).values().sum()
    }
}

#[async_trait::async_trait]
impl RecipeSource for MockSource {
    async fn fetch_recipes(&self, query: &RecipeQuery) -> SourceResult<Vec<Recipe>> {
        let mut held = self.gate.as_ref().map(|gate| Box::pin(gate.notified()));
        if let Some(notified) = held.as_mut() {
            notified.as_mut().enable();
        }
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(query.filter_object_query.clone())
            .or_insert(0) += 1;
        if let Some(notified) = held {
            notified.await;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(err);
        }
        let recipes = self.recipes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(recipes.iter().filter(|r| query.matches(r)).cloned().collect())
    }
}

// ----------------- File-backed implementation -----------------

#[derive(Deserialize)]
#[serde(untagged)]
enum RecipeDump {
    Page { results: Vec<Recipe> },
    List(Vec<Recipe>),
}

/// Source over a JSON dump of recipes: either a bare array or an API page
/// object with a `results` array.
pub struct JsonFileSource {
    recipes: Vec<Recipe>,
}

impl JsonFileSource {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let t0 = Instant::now();
        let bytes = std::fs::read(path).with_context(|| format!("reading recipes from {}", path.display()))?;
        let source = Self::from_slice(&bytes).with_context(|| format!("parsing recipes from {}", path.display()))?;
        info!(path = %path.display(), recipes = source.recipes.len(), took_ms = %t0.elapsed().as_millis(), "source: recipes loaded");
        Ok(source)
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let recipes = match serde_json::from_slice::<RecipeDump>(bytes)? {
            RecipeDump::Page { results } => results,
            RecipeDump::List(list) => list,
        };
        Ok(Self { recipes })
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }
}

#[async_trait::async_trait]
impl RecipeSource for JsonFileSource {
    async fn fetch_recipes(&self, query: &RecipeQuery) -> SourceResult<Vec<Recipe>> {
        let out: Vec<Recipe> = self.recipes.iter().filter(|r| query.matches(r)).cloned().collect();
        debug!(query = %query, matched = out.len(), "source: query evaluated");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recipes() -> Vec<Recipe> {
        serde_json::from_value(json!([
            {"id": 1, "latest_revision": {"name": "a", "filter_object": [
                {"type": "namespaceSample", "namespace": "ns", "start": 0, "count": 10}
            ]}},
            {"id": 2, "latest_revision": {"name": "b", "filter_object": [
                {"type": "bucketSample", "start": 0, "count": 10, "total": 10000, "input": ["\"ns\"", "normandy.userId"]}
            ]}},
            {"id": 3, "latest_revision": {"name": "c", "filter_object": [
                {"type": "stableSample", "rate": 0.1, "input": ["normandy.userId", "'other'"]},
                {"type": "channel", "channels": ["beta"]}
            ]}},
        ]))
        .expect("recipes parse")
    }

    #[test]
    fn query_builders_format_pairs() {
        assert_eq!(RecipeQuery::namespace_sample("ns").as_str(), "type:namespaceSample,namespace:ns");
        assert_eq!(RecipeQuery::bucket_sample_input("ns").as_str(), "type:bucketSample,input:ns");
        assert_eq!(RecipeQuery::of_type("stableSample").to_string(), "type:stableSample");
        let q = RecipeQuery::stable_sample_input("a:b");
        let pairs: Vec<_> = q.pairs().collect();
        assert_eq!(pairs, vec![("type", "stableSample"), ("input", "a:b")]);
    }

    #[test]
    fn queries_match_by_type_namespace_and_input() {
        let all = recipes();
        let ids = |q: RecipeQuery| all.iter().filter(|r| q.matches(r)).map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(RecipeQuery::namespace_sample("ns")), vec![1]);
        assert_eq!(ids(RecipeQuery::bucket_sample_input("ns")), vec![2]);
        assert_eq!(ids(RecipeQuery::stable_sample_input("other")), vec![3]);
        assert_eq!(ids(RecipeQuery::stable_sample_input("ns")), Vec::<u64>::new());
        assert_eq!(ids(RecipeQuery::of_type("channel")), vec![3]);
        assert_eq!(ids(RecipeQuery::from_pairs([("type", "channel"), ("color", "red")])), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn mock_counts_calls_and_fails_on_demand() {
        let mock = MockSource::new(recipes());
        let q = RecipeQuery::namespace_sample("ns");
        assert_eq!(mock.fetch_recipes(&q).await.expect("ok").len(), 1);
        mock.set_failure(Some(SourceError::Transport("boom".into())));
        assert_eq!(mock.fetch_recipes(&q).await, Err(SourceError::Transport("boom".into())));
        assert_eq!(mock.calls_for(&q), 2);
        assert_eq!(mock.total_calls(), 2);
    }

    #[tokio::test]
    async fn file_source_accepts_page_and_list_dumps() {
        let page = serde_json::to_vec(&json!({ "count": 3, "results": recipes() })).expect("serialize");
        let src = JsonFileSource::from_slice(&page).expect("page parses");
        assert_eq!(src.recipes().len(), 3);
        let list = serde_json::to_vec(&recipes()).expect("serialize");
        let src = JsonFileSource::from_slice(&list).expect("list parses");
        let hits = src.fetch_recipes(&RecipeQuery::of_type("bucketSample")).await.expect("ok");
        assert_eq!(hits.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn file_source_keeps_dump_with_a_malformed_filter() {
        let dump = json!({"results": [
            {"id": 1, "latest_revision": {"name": "good", "filter_object": [
                {"type": "namespaceSample", "namespace": "ns", "start": 0, "count": 10}
            ]}},
            {"id": 2, "latest_revision": {"name": "bad", "filter_object": [
                {"type": "bucketSample", "start": 0, "count": 10, "input": ["\"ns\"", "normandy.userId"]}
            ]}},
        ]});
        let src = JsonFileSource::from_slice(&serde_json::to_vec(&dump).expect("serialize")).expect("dump parses");
        assert_eq!(src.recipes().len(), 2);
        let bad = RecipeQuery::bucket_sample_input("ns");
        let hits: Vec<_> = src.recipes().iter().filter(|r| bad.matches(r)).map(|r| r.id).collect();
        assert_eq!(hits, vec![2]);
    }

    #[tokio::test]
    async fn gated_mock_holds_fetches_until_notified() {
        let gate = Arc::new(Notify::new());
        let mock = Arc::new(MockSource::new(recipes()).with_gate(gate.clone()));
        let q = RecipeQuery::namespace_sample("ns");
        let task = tokio::spawn({
            let mock = mock.clone();
            let q = q.clone();
            async move { mock.fetch_recipes(&q).await }
        });
        while mock.calls_for(&q) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!task.is_finished());
        gate.notify_waiters();
        assert_eq!(task.await.expect("join").expect("ok").len(), 1);
    }
}
