//! Normandy core types: filter objects, recipes and the sampling-filter algebra.

#![forbid(unsafe_code)]

pub mod categorize;
pub mod filters;
pub mod normalize;
pub mod recipe;

pub use categorize::{categorize_recipes, Categorized, CategorizedRecipe};
pub use filters::{
    get_namespace_for_filter, is_sampling_filter, quoted_literal_body, BucketSample, ChannelFilter,
    CountryFilter, FilterObject, Input, LocaleFilter, MalformedSample, NamespaceSample, StableSample, VersionFilter,
};
pub use normalize::{
    bucket_form_to_namespace_form, normalize_to_namespace_sample, to_bucket_form, NormalizeOptions,
    SampleFilterError,
};
pub use recipe::{Recipe, RecipeId, Revision};

/// Size of the bucket space every sampling filter is addressed in.
pub const BUCKET_COUNT: u32 = 10_000;

/// Input expression that stands for the per-client user id.
pub const USER_ID_INPUT: &str = "normandy.userId";

/// Display range `[start, start + count]` of a sampling filter.
/// The end may exceed [`BUCKET_COUNT`] when the range wraps.
pub type BucketRange = (u32, u32);

pub mod prelude {
    pub use super::{
        BucketRange, FilterObject, NamespaceSample, Recipe, RecipeId, Revision, SampleFilterError,
        BUCKET_COUNT, USER_ID_INPUT,
    };
}

/// Convert a stable-sample rate into a bucket count.
pub fn rate_to_count(rate: f64) -> u32 {
    (rate * BUCKET_COUNT as f64).round().clamp(0.0, BUCKET_COUNT as f64) as u32
}
