//! Conversion of any sampling filter into the canonical `namespaceSample` form.
//!
//! The pipeline has two stages: [`to_bucket_form`] lifts stable samples into
//! bucket samples, then [`bucket_form_to_namespace_form`] validates the
//! inputs and extracts the namespace. Each failure mode is its own variant of
//! [`SampleFilterError`].

use std::borrow::Cow;

use serde::Serialize;
use serde_json::Value;

use crate::filters::{quoted_literal_body, BucketSample, FilterObject, NamespaceSample};
use crate::recipe::Revision;
use crate::{BUCKET_COUNT, USER_ID_INPUT};

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum SampleFilterError {
    #[error("revision has no sampling filter")]
    NoSampleFilter,
    #[error("revision has {count} sampling filters, expected exactly one")]
    TooManySampleFilters { count: usize },
    #[error("sampling filter has {count} inputs, expected 2")]
    WrongNumberOfInputs { count: usize },
    #[error("sampling filter inputs are in reverse order")]
    BackwardsInputs,
    #[error("input {input} is not a quoted namespace id")]
    NotANamespaceId { input: String },
    #[error("input {input} is not {}", USER_ID_INPUT)]
    NotAUserId { input: String },
    #[error("bucket total is {total}, expected {}", BUCKET_COUNT)]
    WrongTotal { total: u32 },
    #[error("input {input} is not a string")]
    NonStringInput { input: Value },
    #[error("{kind} filter is malformed: {reason}")]
    Malformed { kind: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Expect `[user id, namespace]` instead of `[namespace, user id]`.
    pub backwards_inputs: bool,
}

impl NormalizeOptions {
    pub fn backwards() -> Self {
        Self { backwards_inputs: true }
    }
}

/// Bucket-sample view of a bucket or stable sample. `None` for other kinds.
pub fn to_bucket_form(fo: &FilterObject) -> Option<Cow<'_, BucketSample>> {
    match fo {
        FilterObject::BucketSample(b) => Some(Cow::Borrowed(b)),
        FilterObject::StableSample(s) => Some(Cow::Owned(s.to_bucket_sample())),
        _ => None,
    }
}

pub fn bucket_form_to_namespace_form(
    bucket: &BucketSample,
    opts: NormalizeOptions,
) -> Result<NamespaceSample, SampleFilterError> {
    let input = &bucket.input;
    if input.len() != 2 {
        return Err(SampleFilterError::WrongNumberOfInputs { count: input.len() });
    }
    let mut strings = [""; 2];
    for (slot, entry) in strings.iter_mut().zip(input.iter()) {
        *slot = entry
            .as_str()
            .ok_or_else(|| SampleFilterError::NonStringInput { input: entry.clone() })?;
    }
    let (ns_idx, user_idx) = if opts.backwards_inputs { (1, 0) } else { (0, 1) };
    let (ns_input, user_input) = (strings[ns_idx], strings[user_idx]);

    if ns_input == USER_ID_INPUT && quoted_literal_body(user_input).is_some() {
        return Err(SampleFilterError::BackwardsInputs);
    }
    let namespace = quoted_literal_body(ns_input)
        .ok_or_else(|| SampleFilterError::NotANamespaceId { input: ns_input.to_string() })?;
    if user_input != USER_ID_INPUT {
        return Err(SampleFilterError::NotAUserId { input: user_input.to_string() });
    }
    if bucket.total != BUCKET_COUNT {
        return Err(SampleFilterError::WrongTotal { total: bucket.total });
    }
    Ok(NamespaceSample {
        namespace: namespace.to_string(),
        start: bucket.start,
        count: bucket.count,
        auto: false,
    })
}

/// Canonical namespace sample for the single sampling filter of `revision`.
pub fn normalize_to_namespace_sample(
    revision: &Revision,
    opts: NormalizeOptions,
) -> Result<NamespaceSample, SampleFilterError> {
    let mut samples = revision.sampling_filters();
    let fo = samples.next().ok_or(SampleFilterError::NoSampleFilter)?;
    let extra = samples.count();
    if extra > 0 {
        return Err(SampleFilterError::TooManySampleFilters { count: extra + 1 });
    }
    match fo {
        FilterObject::NamespaceSample(ns) => return Ok(ns.clone()),
        FilterObject::Malformed(m) => {
            return Err(SampleFilterError::Malformed { kind: m.kind.clone(), reason: m.reason.clone() })
        }
        _ => {}
    }
    match to_bucket_form(fo) {
        Some(bucket) => bucket_form_to_namespace_form(&bucket, opts),
        None => Err(SampleFilterError::NoSampleFilter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revision(filters: Value) -> Revision {
        serde_json::from_value(json!({ "name": "r", "filter_object": filters })).expect("revision parses")
    }

    fn bucket(input: Value, total: u32) -> Value {
        json!({"type": "bucketSample", "start": 100, "count": 50, "total": total, "input": input})
    }

    #[test]
    fn namespace_sample_is_already_canonical() {
        let rev = revision(json!([
            {"type": "channel", "channels": ["beta"]},
            {"type": "namespaceSample", "namespace": "ns", "start": 10, "count": 20},
        ]));
        let ns = normalize_to_namespace_sample(&rev, NormalizeOptions::default()).expect("ok");
        assert_eq!(ns, NamespaceSample { namespace: "ns".into(), start: 10, count: 20, auto: false });
    }

    #[test]
    fn bucket_sample_converts() {
        let rev = revision(json!([bucket(json!(["\"study\"", "normandy.userId"]), 10_000)]));
        let ns = normalize_to_namespace_sample(&rev, NormalizeOptions::default()).expect("ok");
        assert_eq!(ns.namespace, "study");
        assert_eq!(ns.bucket_range(), (100, 150));
    }

    #[test]
    fn stable_sample_converts_through_bucket_form() {
        let rev = revision(json!([{"type": "stableSample", "rate": 0.25, "input": ["'study'", "normandy.userId"]}]));
        let ns = normalize_to_namespace_sample(&rev, NormalizeOptions::default()).expect("ok");
        assert_eq!((ns.namespace.as_str(), ns.start, ns.count), ("study", 0, 2500));
    }

    #[test]
    fn backwards_inputs_are_detected_and_recoverable() {
        let rev = revision(json!([bucket(json!(["normandy.userId", "\"my-namespace\""]), 10_000)]));
        assert_eq!(
            normalize_to_namespace_sample(&rev, NormalizeOptions::default()),
            Err(SampleFilterError::BackwardsInputs)
        );
        let ns = normalize_to_namespace_sample(&rev, NormalizeOptions::backwards()).expect("ok");
        assert_eq!(ns.namespace, "my-namespace");
        assert_eq!(ns.bucket_range(), (100, 150));
    }

    #[test]
    fn forward_inputs_fail_under_backwards_convention() {
        let rev = revision(json!([bucket(json!(["\"ns\"", "normandy.userId"]), 10_000)]));
        assert_eq!(
            normalize_to_namespace_sample(&rev, NormalizeOptions::backwards()),
            Err(SampleFilterError::BackwardsInputs)
        );
    }

    #[test]
    fn multiplicity_errors() {
        let two = revision(json!([
            {"type": "namespaceSample", "namespace": "a", "start": 0, "count": 1},
            {"type": "namespaceSample", "namespace": "b", "start": 0, "count": 1},
        ]));
        assert_eq!(
            normalize_to_namespace_sample(&two, NormalizeOptions::default()),
            Err(SampleFilterError::TooManySampleFilters { count: 2 })
        );
        let none = revision(json!([{"type": "locale", "locales": ["en-US"]}]));
        assert_eq!(
            normalize_to_namespace_sample(&none, NormalizeOptions::default()),
            Err(SampleFilterError::NoSampleFilter)
        );
    }

    #[test]
    fn input_shape_errors() {
        let opts = NormalizeOptions::default();
        let cases = vec![
            (json!(["\"ns\""]), 10_000, SampleFilterError::WrongNumberOfInputs { count: 1 }),
            (json!(["\"ns\"", 7]), 10_000, SampleFilterError::NonStringInput { input: json!(7) }),
            (
                json!(["normandy.clientId", "normandy.userId"]),
                10_000,
                SampleFilterError::NotANamespaceId { input: "normandy.clientId".into() },
            ),
            (
                json!(["\"ns\"", "normandy.clientId"]),
                10_000,
                SampleFilterError::NotAUserId { input: "normandy.clientId".into() },
            ),
            (json!(["\"ns\"", "normandy.userId"]), 1_000, SampleFilterError::WrongTotal { total: 1_000 }),
        ];
        for (input, total, expected) in cases {
            let rev = revision(json!([bucket(input.clone(), total)]));
            assert_eq!(normalize_to_namespace_sample(&rev, opts), Err(expected), "input {input}");
        }
    }

    #[test]
    fn malformed_sample_reports_its_parse_failure() {
        let rev = revision(json!([{"type": "stableSample", "rate": "high", "input": ["\"ns\"", "normandy.userId"]}]));
        let err = normalize_to_namespace_sample(&rev, NormalizeOptions::default()).expect_err("malformed");
        assert!(matches!(&err, SampleFilterError::Malformed { kind, .. } if kind == "stableSample"));
        assert!(err.to_string().starts_with("stableSample filter is malformed"));

        let two = revision(json!([
            {"type": "namespaceSample", "namespace": "a", "start": 0, "count": 1},
            {"type": "bucketSample", "count": 1},
        ]));
        assert_eq!(
            normalize_to_namespace_sample(&two, NormalizeOptions::default()),
            Err(SampleFilterError::TooManySampleFilters { count: 2 })
        );
    }
}
