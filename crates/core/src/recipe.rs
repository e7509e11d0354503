use serde::{Deserialize, Serialize};

use crate::filters::{is_sampling_filter, FilterObject};

pub type RecipeId = u64;

/// A recipe revision. Only the fields the bucket algebra reads are typed;
/// everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Revision {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub filter_object: Vec<FilterObject>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Revision {
    pub fn sampling_filters(&self) -> impl Iterator<Item = &FilterObject> {
        self.filter_object.iter().filter(|fo| is_sampling_filter(fo))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecipeId,
    pub latest_revision: Revision,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Recipe {
    pub fn new(id: RecipeId, name: &str, filter_object: Vec<FilterObject>) -> Self {
        Self {
            id,
            latest_revision: Revision { name: name.to_string(), filter_object, extra: Default::default() },
            extra: Default::default(),
        }
    }
}
