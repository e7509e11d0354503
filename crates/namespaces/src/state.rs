//! Per-environment namespace state and the reducer that evolves it.
//!
//! States are immutable values: every action produces a new state, which the
//! coordinator publishes as a fresh snapshot.

use std::collections::{BTreeMap, BTreeSet};

use normandy_core::Recipe;
use serde::Serialize;

use crate::KEY_SEPARATOR;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NamespaceState {
    namespaces: BTreeSet<String>,
    recipes_by_namespace: BTreeMap<String, Vec<Recipe>>,
    loading: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NamespaceAction {
    /// Union names into the known namespace set.
    AddNamespaces(Vec<String>),
    /// Replace the recipe list of one namespace wholesale.
    SetRecipes { namespace: String, recipes: Vec<Recipe> },
    StartLoading(String),
    FinishLoading(String),
}

impl NamespaceState {
    pub fn reduce(&self, action: &NamespaceAction) -> NamespaceState {
        let mut next = self.clone();
        match action {
            NamespaceAction::AddNamespaces(names) => {
                next.namespaces.extend(names.iter().cloned());
            }
            NamespaceAction::SetRecipes { namespace, recipes } => {
                next.recipes_by_namespace.insert(namespace.clone(), recipes.clone());
            }
            NamespaceAction::StartLoading(key) => {
                next.loading.insert(key.clone());
            }
            NamespaceAction::FinishLoading(key) => {
                next.loading.remove(key);
            }
        }
        next
    }

    pub fn namespaces(&self) -> &BTreeSet<String> {
        &self.namespaces
    }

    pub fn recipes_by_namespace(&self) -> &BTreeMap<String, Vec<Recipe>> {
        &self.recipes_by_namespace
    }

    pub fn recipes_in(&self, namespace: &str) -> &[Recipe] {
        self.recipes_by_namespace.get(namespace).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn loading(&self) -> &BTreeSet<String> {
        &self.loading
    }

    /// True when every segment (or `::`-joined run of segments) appears in
    /// some in-flight key. Different segments may match different keys.
    /// With no segments, true when anything at all is loading.
    pub fn is_loading(&self, segments: &[&str]) -> bool {
        if segments.is_empty() {
            return !self.loading.is_empty();
        }
        let padded: Vec<String> = self
            .loading
            .iter()
            .map(|key| format!("{KEY_SEPARATOR}{key}{KEY_SEPARATOR}"))
            .collect();
        segments.iter().all(|segment| {
            let needle = format!("{KEY_SEPARATOR}{segment}{KEY_SEPARATOR}");
            padded.iter().any(|key| key.contains(&needle))
        })
    }
}
