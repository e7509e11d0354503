//! Filter objects attached to a recipe revision.
//!
//! Filters are tagged by `type` on the wire. The sampling kinds
//! (`bucketSample`, `stableSample`, `namespaceSample`) are interpreted by
//! the bucket algebra; the targeting kinds are carried as data; anything
//! else round-trips as opaque JSON. A sampling filter whose fields do not
//! parse is kept as [`MalformedSample`] so one bad recipe never hides the
//! rest of a listing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};
use smallvec::SmallVec;

use crate::{rate_to_count, BucketRange, USER_ID_INPUT};

/// Ordered expression fragments of a bucket/stable sample.
pub type Input = SmallVec<[Value; 2]>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionFilter {
    pub versions: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryFilter {
    pub countries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleFilter {
    pub locales: Vec<String>,
}

/// Whole number in `u32` range. Integral floats such as `10000.0` are
/// accepted since JSON does not distinguish them.
fn whole_u32(n: &Number) -> Result<u32, String> {
    if let Some(u) = n.as_u64() {
        return u32::try_from(u).map_err(|_| format!("{n} is out of range"));
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&f) => Ok(f as u32),
        _ => Err(format!("expected a whole number, got {n}")),
    }
}

fn de_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let n = Number::deserialize(deserializer)?;
    whole_u32(&n).map_err(serde::de::Error::custom)
}

/// Generic modular sampling over `input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSample {
    #[serde(deserialize_with = "de_u32")]
    pub start: u32,
    #[serde(deserialize_with = "de_u32")]
    pub count: u32,
    #[serde(deserialize_with = "de_u32")]
    pub total: u32,
    pub input: Input,
}

/// Percentage sampling, equivalent to a bucket sample starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StableSample {
    pub rate: f64,
    pub input: Input,
}

impl StableSample {
    /// Equivalent `bucketSample` over the full bucket space.
    pub fn to_bucket_sample(&self) -> BucketSample {
        BucketSample {
            start: 0,
            count: rate_to_count(self.rate),
            total: crate::BUCKET_COUNT,
            input: self.input.clone(),
        }
    }
}

/// Canonical, namespace-addressed sampling filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawNamespaceSample")]
pub struct NamespaceSample {
    pub namespace: String,
    /// Ignored while `auto` is set; filled in by auto-bucketing.
    pub start: u32,
    pub count: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto: bool,
}

/// Wire shape: `start` may only be omitted on a pending `auto` filter.
#[derive(Deserialize)]
struct RawNamespaceSample {
    namespace: String,
    start: Option<Number>,
    count: Number,
    #[serde(default)]
    auto: bool,
}

impl TryFrom<RawNamespaceSample> for NamespaceSample {
    type Error = String;

    fn try_from(raw: RawNamespaceSample) -> Result<Self, Self::Error> {
        let start = match (&raw.start, raw.auto) {
            (Some(n), _) => whole_u32(n)?,
            (None, true) => 0,
            (None, false) => return Err("missing field `start`".to_string()),
        };
        Ok(Self { namespace: raw.namespace, start, count: whole_u32(&raw.count)?, auto: raw.auto })
    }
}

/// Sampling filter of a known kind whose fields failed to parse. The raw
/// object is kept verbatim for display and round-tripping.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedSample {
    pub kind: String,
    pub reason: String,
    pub raw: Value,
}

impl MalformedSample {
    /// String entries of the raw `input` array, if any.
    pub fn input_strings(&self) -> impl Iterator<Item = &str> {
        self.raw.get("input").and_then(Value::as_array).into_iter().flatten().filter_map(Value::as_str)
    }
}

impl NamespaceSample {
    pub fn bucket_range(&self) -> BucketRange {
        (self.start, self.start.saturating_add(self.count))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterObject {
    Channel(ChannelFilter),
    Version(VersionFilter),
    Country(CountryFilter),
    Locale(LocaleFilter),
    BucketSample(BucketSample),
    StableSample(StableSample),
    NamespaceSample(NamespaceSample),
    /// Sampling filter that failed to parse.
    Malformed(MalformedSample),
    /// Unknown filter type, kept verbatim.
    Opaque(Value),
}

const TARGETING_TYPES: &[&str] = &["channel", "version", "country", "locale"];
const SAMPLING_TYPES: &[&str] = &["bucketSample", "stableSample", "namespaceSample"];

impl FilterObject {
    /// Wire tag of the filter (`type` field).
    pub fn kind(&self) -> &str {
        match self {
            FilterObject::Channel(_) => "channel",
            FilterObject::Version(_) => "version",
            FilterObject::Country(_) => "country",
            FilterObject::Locale(_) => "locale",
            FilterObject::BucketSample(_) => "bucketSample",
            FilterObject::StableSample(_) => "stableSample",
            FilterObject::NamespaceSample(_) => "namespaceSample",
            FilterObject::Malformed(m) => &m.kind,
            FilterObject::Opaque(v) => v.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }

    /// `(start, count)` for sampling filters, `None` otherwise.
    pub fn bucket_range(&self) -> Option<(u32, u32)> {
        match self {
            FilterObject::BucketSample(b) => Some((b.start, b.count)),
            FilterObject::StableSample(s) => Some((0, rate_to_count(s.rate))),
            FilterObject::NamespaceSample(n) => Some((n.start, n.count)),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum TaggedRef<'a> {
    Channel(&'a ChannelFilter),
    Version(&'a VersionFilter),
    Country(&'a CountryFilter),
    Locale(&'a LocaleFilter),
    BucketSample(&'a BucketSample),
    StableSample(&'a StableSample),
    NamespaceSample(&'a NamespaceSample),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Tagged {
    Channel(ChannelFilter),
    Version(VersionFilter),
    Country(CountryFilter),
    Locale(LocaleFilter),
    BucketSample(BucketSample),
    StableSample(StableSample),
    NamespaceSample(NamespaceSample),
}

impl Serialize for FilterObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tagged = match self {
            FilterObject::Channel(f) => TaggedRef::Channel(f),
            FilterObject::Version(f) => TaggedRef::Version(f),
            FilterObject::Country(f) => TaggedRef::Country(f),
            FilterObject::Locale(f) => TaggedRef::Locale(f),
            FilterObject::BucketSample(f) => TaggedRef::BucketSample(f),
            FilterObject::StableSample(f) => TaggedRef::StableSample(f),
            FilterObject::NamespaceSample(f) => TaggedRef::NamespaceSample(f),
            FilterObject::Malformed(m) => return m.raw.serialize(serializer),
            FilterObject::Opaque(v) => return v.serialize(serializer),
        };
        tagged.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FilterObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let sampling = SAMPLING_TYPES.contains(&kind);
        if !sampling && !TARGETING_TYPES.contains(&kind) {
            return Ok(FilterObject::Opaque(value));
        }
        let tagged = match Tagged::deserialize(&value) {
            Ok(tagged) => tagged,
            Err(e) if sampling => {
                return Ok(FilterObject::Malformed(MalformedSample {
                    kind: kind.to_string(),
                    reason: e.to_string(),
                    raw: value,
                }))
            }
            Err(_) => return Ok(FilterObject::Opaque(value)),
        };
        Ok(match tagged {
            Tagged::Channel(f) => FilterObject::Channel(f),
            Tagged::Version(f) => FilterObject::Version(f),
            Tagged::Country(f) => FilterObject::Country(f),
            Tagged::Locale(f) => FilterObject::Locale(f),
            Tagged::BucketSample(f) => FilterObject::BucketSample(f),
            Tagged::StableSample(f) => FilterObject::StableSample(f),
            Tagged::NamespaceSample(f) => FilterObject::NamespaceSample(f),
        })
    }
}

static QUOTED_LITERAL: Lazy<Regex> = Lazy::new(|| {
    // Same opening and closing quote; the regex crate has no backreferences.
    Regex::new(r#"^(?:'.*'|".*")$"#).expect("static regex")
});

/// Body of a single- or double-quoted string literal, without the quotes.
pub fn quoted_literal_body(s: &str) -> Option<&str> {
    if QUOTED_LITERAL.is_match(s) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

pub fn is_sampling_filter(fo: &FilterObject) -> bool {
    matches!(
        fo,
        FilterObject::BucketSample(_)
            | FilterObject::StableSample(_)
            | FilterObject::NamespaceSample(_)
            | FilterObject::Malformed(_)
    )
}

/// Namespace a sampling filter draws from.
///
/// For bucket and stable samples this is the quoted literal among exactly
/// two inputs that is not the user id token. Order is not checked here.
/// Malformed filters have no namespace.
pub fn get_namespace_for_filter(fo: &FilterObject) -> Option<&str> {
    let input = match fo {
        FilterObject::NamespaceSample(n) => return Some(n.namespace.as_str()),
        FilterObject::BucketSample(b) => &b.input,
        FilterObject::StableSample(s) => &s.input,
        _ => return None,
    };
    if input.len() != 2 {
        return None;
    }
    input
        .iter()
        .filter_map(Value::as_str)
        .filter(|s| *s != USER_ID_INPUT)
        .find_map(quoted_literal_body)
}
