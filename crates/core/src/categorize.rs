//! Split recipes into ok / backwards / error groups for namespace listings.

use serde::Serialize;
use tracing::debug;

use crate::normalize::{normalize_to_namespace_sample, NormalizeOptions, SampleFilterError};
use crate::recipe::Recipe;
use crate::BucketRange;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorizedRecipe<'a> {
    pub recipe: &'a Recipe,
    pub bucket_range: Option<BucketRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<SampleFilterError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Categorized<'a> {
    pub ok: Vec<CategorizedRecipe<'a>>,
    pub backwards: Vec<CategorizedRecipe<'a>>,
    pub error: Vec<CategorizedRecipe<'a>>,
}

fn sort_key(entry: &CategorizedRecipe<'_>) -> (u64, u64, u64) {
    let (lo, hi) = entry
        .bucket_range
        .map(|(s, e)| (s as u64, e as u64))
        .unwrap_or((u64::MAX, u64::MAX));
    (lo, hi, entry.recipe.id)
}

pub fn categorize_recipes(recipes: &[Recipe]) -> Categorized<'_> {
    let mut out = Categorized::default();
    for recipe in recipes {
        let revision = &recipe.latest_revision;
        match normalize_to_namespace_sample(revision, NormalizeOptions::default()) {
            Ok(ns) => out.ok.push(CategorizedRecipe { recipe, bucket_range: Some(ns.bucket_range()), err: None }),
            Err(SampleFilterError::BackwardsInputs) => {
                match normalize_to_namespace_sample(revision, NormalizeOptions::backwards()) {
                    Ok(ns) => out.backwards.push(CategorizedRecipe {
                        recipe,
                        bucket_range: Some(ns.bucket_range()),
                        err: None,
                    }),
                    Err(err) => out.error.push(CategorizedRecipe { recipe, bucket_range: None, err: Some(err) }),
                }
            }
            Err(err) => {
                debug!(recipe = recipe.id, error = %err, "sampling filter rejected");
                out.error.push(CategorizedRecipe { recipe, bucket_range: None, err: Some(err) });
            }
        }
    }
    for group in [&mut out.ok, &mut out.backwards, &mut out.error] {
        group.sort_by_key(sort_key);
    }
    out
}
