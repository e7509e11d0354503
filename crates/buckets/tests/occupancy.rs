#![forbid(unsafe_code)]

use normandy_buckets::find_occupied_buckets;
use normandy_core::Recipe;
use serde_json::json;

fn recipe(id: u64, filters: serde_json::Value) -> Recipe {
    serde_json::from_value(json!({
        "id": id,
        "latest_revision": { "name": format!("recipe-{id}"), "filter_object": filters },
    }))
    .expect("recipe parses")
}

fn ns_sample(namespace: &str, start: u32, count: u32) -> serde_json::Value {
    json!({"type": "namespaceSample", "namespace": namespace, "start": start, "count": count})
}

fn occupied_slots(occupied: &[bool]) -> Vec<usize> {
    occupied.iter().enumerate().filter(|(_, o)| **o).map(|(i, _)| i).collect()
}

#[test]
fn namespace_sample_wraps_around() {
    let recipes = vec![recipe(1, json!([ns_sample("ns", 9_000, 2_000)]))];
    let occ = find_occupied_buckets("ns", &recipes);
    let expected: Vec<usize> = (0..1_000).chain(9_000..10_000).collect();
    assert_eq!(occupied_slots(occ.as_slice()), expected);
    assert_eq!(occ.as_slice().len(), 10_000);
}

#[test]
fn stable_sample_occupies_from_zero() {
    let recipes = vec![recipe(1, json!([
        {"type": "stableSample", "rate": 0.5, "input": ["\"ns\"", "normandy.userId"]}
    ]))];
    let occ = find_occupied_buckets("ns", &recipes);
    assert!(occ.as_slice()[..5_000].iter().all(|o| *o));
    assert!(occ.as_slice()[5_000..].iter().all(|o| !*o));
}

#[test]
fn gap_search_skips_to_first_fitting_run() {
    let recipes = vec![
        recipe(1, json!([ns_sample("ns", 0, 200)])),
        recipe(2, json!([ns_sample("ns", 300, 100)])),
        recipe(3, json!([
            {"type": "bucketSample", "start": 400, "count": 150, "total": 10000, "input": ["\"ns\"", "normandy.userId"]}
        ])),
    ];
    let occ = find_occupied_buckets("ns", &recipes);
    assert_eq!(occ.find_space(200), Some(550));
    assert_eq!(occ.find_space(100), Some(200));
}

#[test]
fn no_space_when_request_exceeds_largest_gap() {
    let recipes = vec![recipe(1, json!([ns_sample("ns", 100, 9_000)]))];
    let occ = find_occupied_buckets("ns", &recipes);
    assert_eq!(occ.free_count(), 1_000);
    assert_eq!(occ.find_space(900), Some(9_100));
    assert_eq!(occ.find_space(901), None);
}

#[test]
fn other_namespaces_and_pending_auto_filters_are_ignored() {
    let recipes = vec![
        recipe(1, json!([ns_sample("other", 0, 5_000)])),
        recipe(2, json!([{"type": "namespaceSample", "namespace": "ns", "count": 100, "auto": true}])),
        recipe(3, json!([
            {"type": "bucketSample", "start": 0, "count": 10, "total": 10000, "input": ["\"elsewhere\"", "normandy.userId"]},
            {"type": "channel", "channels": ["nightly"]}
        ])),
        recipe(4, json!([ns_sample("ns", 20, 5)])),
    ];
    let occ = find_occupied_buckets("ns", &recipes);
    assert_eq!(occ.ranges(), vec![(20, 25)]);
}
