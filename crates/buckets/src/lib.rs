//! Bucket occupancy over the fixed 10,000-slot namespace space.
//!
//! Ranges are addressed modulo [`BUCKET_COUNT`], so a sample starting at
//! 9,900 with a count of 200 occupies `[9900, 10000)` and `[0, 100)`.

#![forbid(unsafe_code)]

use normandy_core::{get_namespace_for_filter, FilterObject, Recipe, BUCKET_COUNT};
use serde::Serialize;
use tracing::debug;

/// One flag per bucket; `true` means some recipe samples it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    slots: Vec<bool>,
}

impl Default for Occupancy {
    fn default() -> Self {
        Self::empty()
    }
}

/// Display form of an occupancy vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupancySummary {
    pub namespace: String,
    pub occupied: u32,
    pub free: u32,
    /// Occupied runs as `[start, end)`, in slot order, never wrapping.
    pub ranges: Vec<(u32, u32)>,
}

impl Occupancy {
    pub fn empty() -> Self {
        Self { slots: vec![false; BUCKET_COUNT as usize] }
    }

    /// Mark `count` slots from `start`, wrapping past the last slot.
    pub fn mark(&mut self, start: u32, count: u32) {
        let start = start as u64;
        for offset in 0..count.min(BUCKET_COUNT) as u64 {
            self.slots[((start + offset) % BUCKET_COUNT as u64) as usize] = true;
        }
    }

    pub fn is_occupied(&self, slot: u32) -> bool {
        self.slots[(slot % BUCKET_COUNT) as usize]
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.slots
    }

    pub fn occupied_count(&self) -> u32 {
        self.slots.iter().filter(|s| **s).count() as u32
    }

    pub fn free_count(&self) -> u32 {
        BUCKET_COUNT - self.occupied_count()
    }

    pub fn ranges(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut run_start: Option<u32> = None;
        for (i, occupied) in self.slots.iter().enumerate() {
            match (*occupied, run_start) {
                (true, None) => run_start = Some(i as u32),
                (false, Some(s)) => {
                    out.push((s, i as u32));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            out.push((s, BUCKET_COUNT));
        }
        out
    }

    pub fn summary(&self, namespace: &str) -> OccupancySummary {
        let occupied = self.occupied_count();
        OccupancySummary {
            namespace: namespace.to_string(),
            occupied,
            free: BUCKET_COUNT - occupied,
            ranges: self.ranges(),
        }
    }

    /// Lowest start of a free run of `size` slots.
    ///
    /// Candidate windows start in `0..=BUCKET_COUNT - size` and do not wrap.
    /// When a window hits an occupied slot the next candidate starts just past
    /// the last occupied slot in that window.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds [`BUCKET_COUNT`].
    pub fn find_space(&self, size: u32) -> Option<u32> {
        assert!(size <= BUCKET_COUNT, "requested {size} buckets, space holds {BUCKET_COUNT}");
        let last_start = BUCKET_COUNT - size;
        let mut start = 0u32;
        while start <= last_start {
            let blocker = (start..start + size).rev().find(|&i| self.is_occupied(i));
            match blocker {
                Some(slot) => start = slot + 1,
                None => return Some(start),
            }
        }
        None
    }
}

/// Occupancy of `namespace` from every sampling filter of `recipes` that
/// resolves to it. Filters still waiting for auto-bucketing have no start yet
/// and are skipped.
pub fn find_occupied_buckets(namespace: &str, recipes: &[Recipe]) -> Occupancy {
    let mut occupancy = Occupancy::empty();
    let mut marked = 0usize;
    for recipe in recipes {
        for fo in recipe.latest_revision.sampling_filters() {
            if get_namespace_for_filter(fo) != Some(namespace) {
                continue;
            }
            if let FilterObject::NamespaceSample(ns) = fo {
                if ns.auto {
                    continue;
                }
            }
            if let Some((start, count)) = fo.bucket_range() {
                occupancy.mark(start, count);
                marked += 1;
            }
        }
    }
    debug!(namespace = %namespace, recipes = recipes.len(), filters = marked, "occupancy computed");
    occupancy
}
