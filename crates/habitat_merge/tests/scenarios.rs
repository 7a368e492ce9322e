//! End-to-end runs of the pipeline against the in-memory store.

use geo::{polygon, Area, Polygon};
use habitat_merge::{
    adaptive_simplify, run, FailureKind, MergeConfig, Outcome, PartitionStrategy, RunReport,
    RunStatus, ShutdownToken, TypeThresholds,
};
use habitat_store::geojson::{read_candidates_file, write_habitats_file};
use habitat_store::geometry;
use habitat_store::{Candidate, CandidateId, HabitatType, InputCs, MemoryStore};
use std::collections::BTreeMap;
use std::io::Write;

fn rect(x: f64, y: f64, w: f64, h: f64) -> Polygon<f64> {
    polygon![
        (x: x, y: y),
        (x: x + w, y: y),
        (x: x + w, y: y + h),
        (x: x, y: y + h),
        (x: x, y: y),
    ]
}

fn candidate(id: CandidateId, t: HabitatType, p: Polygon<f64>) -> Candidate {
    Candidate::new(id, t, p)
}

fn run_default(candidates: Vec<Candidate>) -> (MemoryStore, RunReport) {
    run_with(candidates, &MergeConfig::default())
}

fn run_with(candidates: Vec<Candidate>, config: &MergeConfig) -> (MemoryStore, RunReport) {
    let store = MemoryStore::new(candidates).unwrap();
    let report = run(&store, config, &ShutdownToken::new()).unwrap();
    (store, report)
}

/// Two wood clusters, a grassland pair, arable plots, a lone urban block
/// and some unclassified ground.
fn landscape() -> Vec<Candidate> {
    use HabitatType::*;
    vec![
        // Wood pair, 5 m gap.
        candidate(1, Wood, rect(0.0, 0.0, 300.0, 200.0)),
        candidate(2, Wood, rect(305.0, 0.0, 200.0, 200.0)),
        // Wood triple, 3 m gaps, small members.
        candidate(3, Wood, rect(0.0, 1_000.0, 150.0, 150.0)),
        candidate(4, Wood, rect(153.0, 1_000.0, 150.0, 150.0)),
        candidate(5, Wood, rect(306.0, 1_000.0, 150.0, 150.0)),
        // Grassland chain, 15 m gaps (grassland merges within 20 m).
        candidate(6, Grassland, rect(0.0, 2_000.0, 200.0, 200.0)),
        candidate(7, Grassland, rect(215.0, 2_000.0, 200.0, 200.0)),
        // Lone arable plots, one large and one small.
        candidate(8, Arable, rect(0.0, 3_000.0, 300.0, 300.0)),
        candidate(9, Arable, rect(1_000.0, 3_000.0, 100.0, 100.0)),
        // Arable 1 m from 8.
        candidate(10, Arable, rect(301.0, 3_000.0, 50.0, 50.0)),
        // Urban next to wood: different types never merge.
        candidate(11, Urban, rect(510.0, 0.0, 300.0, 200.0)),
        // Unclassified.
        candidate(12, None, rect(0.0, 4_000.0, 500.0, 500.0)),
    ]
}

fn assert_full_coverage(store: &MemoryStore, report: &RunReport, eligible: &[CandidateId]) {
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.outcomes.len(), eligible.len());

    for id in eligible {
        let outcome = report
            .outcome(*id)
            .unwrap_or_else(|| panic!("{id} has no outcome"));
        assert_ne!(outcome, Outcome::Pending, "{id} was never resolved");
    }

    let habitats = store.habitats();
    assert_eq!(habitats.len(), report.committed());

    // Every committed row is keyed by an id that resolved to it.
    for h in &habitats {
        match report.outcome(h.representative_id) {
            Some(Outcome::Merged { representative }) => {
                assert_eq!(representative, h.representative_id)
            }
            Some(Outcome::Fallback) => {}
            other => panic!("{} committed but resolved as {other:?}", h.representative_id),
        }
    }
}

#[test]
fn close_pair_becomes_one_habitat_keyed_by_the_larger() {
    let (store, report) = run_default(vec![
        candidate(20, HabitatType::Wood, rect(305.0, 0.0, 200.0, 200.0)),
        candidate(10, HabitatType::Wood, rect(0.0, 0.0, 300.0, 200.0)),
    ]);

    assert_full_coverage(&store, &report, &[10, 20]);
    let habitats = store.habitats();
    assert_eq!(habitats.len(), 1);
    assert_eq!(habitats[0].representative_id, 10);
    assert_eq!(habitats[0].habitat_type, HabitatType::Wood);
    assert_eq!(report.outcome(20), Some(Outcome::Merged { representative: 10 }));
}

#[test]
fn lone_small_candidate_is_dropped() {
    let (store, report) = run_default(vec![candidate(
        30,
        HabitatType::Arable,
        rect(0.0, 0.0, 200.0, 150.0),
    )]);

    assert_full_coverage(&store, &report, &[30]);
    assert_eq!(report.outcome(30), Some(Outcome::Dropped));
    assert!(store.habitats().is_empty());
}

#[test]
fn cluster_with_disjoint_buffers_reverts_to_individual_copies() {
    // Wood merges within 30 m but only grows 5 m, so a 20 m gap links the
    // members without their buffers meeting.
    let mut config = MergeConfig::default();
    config.thresholds.insert(
        HabitatType::Wood,
        TypeThresholds {
            merge_distance: 30.0,
            merge_buffer: 5.0,
        },
    );

    let (store, report) = run_with(
        vec![
            candidate(1, HabitatType::Wood, rect(0.0, 0.0, 300.0, 200.0)),
            candidate(2, HabitatType::Wood, rect(320.0, 0.0, 200.0, 200.0)),
            candidate(3, HabitatType::Wood, rect(540.0, 0.0, 250.0, 240.0)),
        ],
        &config,
    );

    assert_full_coverage(&store, &report, &[1, 2, 3]);
    assert_eq!(report.clusters, 1);
    assert_eq!(report.merged_clusters, 0);
    assert_eq!(report.retried, 3);
    assert_eq!(report.outcome(1), Some(Outcome::Fallback));
    assert_eq!(report.outcome(2), Some(Outcome::Dropped));
    assert_eq!(report.outcome(3), Some(Outcome::Fallback));

    let ids: Vec<_> = store.habitats().iter().map(|h| h.representative_id).collect();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn every_eligible_candidate_ends_in_exactly_one_outcome() {
    let (store, report) = run_default(landscape());
    let eligible: Vec<CandidateId> = (1..=11).collect();
    assert_full_coverage(&store, &report, &eligible);

    assert_eq!(report.outcome(12), None, "unclassified ground is never considered");
    assert_eq!(report.outcome(2), Some(Outcome::Merged { representative: 1 }));
    assert_eq!(report.outcome(7), Some(Outcome::Merged { representative: 6 }));
    assert_eq!(report.outcome(10), Some(Outcome::Merged { representative: 8 }));
    assert_eq!(report.outcome(9), Some(Outcome::Dropped));
    assert_eq!(report.outcome(11), Some(Outcome::Fallback));
}

#[test]
fn results_do_not_depend_on_workers_or_partitioning() {
    let runs = [
        (1, 1, PartitionStrategy::RoundRobin),
        (3, 2, PartitionStrategy::RoundRobin),
        (4, 4, PartitionStrategy::SizeBalanced),
        (7, 3, PartitionStrategy::SizeBalanced),
    ];

    let results: Vec<_> = runs
        .into_iter()
        .map(|(graph_workers, merge_workers, partition)| {
            let config = MergeConfig {
                graph_workers,
                merge_workers,
                partition,
                ..MergeConfig::default()
            };
            let (store, report) = run_with(landscape(), &config);
            let habitats: BTreeMap<CandidateId, f64> = store
                .habitats()
                .iter()
                .map(|h| (h.representative_id, geometry::area(&h.geometry)))
                .collect();
            (report.outcomes, habitats)
        })
        .collect();

    for other in &results[1..] {
        assert_eq!(results[0].0, other.0);
        assert_eq!(
            results[0].1.keys().collect::<Vec<_>>(),
            other.1.keys().collect::<Vec<_>>()
        );
        for (id, area) in &results[0].1 {
            assert!((area - other.1[id]).abs() < 1e-6, "area of {id} differs");
        }
    }
}

#[test]
fn merged_area_covers_the_largest_member() {
    let candidates = landscape();
    let areas: BTreeMap<CandidateId, f64> = candidates.iter().map(|c| (c.id, c.area)).collect();
    let (store, report) = run_default(candidates);

    for h in store.habitats() {
        let members: Vec<CandidateId> = report
            .outcomes
            .iter()
            .filter(|(_, o)| **o == Outcome::Merged { representative: h.representative_id })
            .map(|(id, _)| *id)
            .collect();
        if members.is_empty() {
            continue;
        }
        let largest = members.iter().map(|id| areas[id]).fold(0.0, f64::max);
        assert!(
            geometry::area(&h.geometry) >= largest,
            "habitat {} is smaller than its largest member",
            h.representative_id
        );
    }
}

#[test]
fn solitary_polygon_is_copied_buffered_and_simplified() {
    let original = rect(0.0, 0.0, 300.0, 200.0);
    let (store, report) = run_default(vec![candidate(1, HabitatType::Wood, original.clone())]);
    assert_eq!(report.outcome(1), Some(Outcome::Fallback));

    let habitats = store.habitats();
    assert_eq!(habitats.len(), 1);

    let config = MergeConfig::default();
    let (expected, _) = adaptive_simplify(
        &geometry::buffer(&original, 10.0),
        config.max_simplify_tolerance,
        config.min_simplify_tolerance,
    );
    assert_eq!(habitats[0].geometry, expected);

    let area = geometry::area(&habitats[0].geometry);
    assert!(area >= original.unsigned_area());
    assert!(area <= 320.0 * 220.0);
}

#[test]
fn rejected_commit_reverts_the_cluster_and_is_counted() {
    let store = MemoryStore::new(vec![
        candidate(1, HabitatType::Wood, rect(0.0, 0.0, 300.0, 200.0)),
        candidate(2, HabitatType::Wood, rect(305.0, 0.0, 200.0, 200.0)),
    ])
    .unwrap()
    .with_failing_commits([1]);

    let report = run(&store, &MergeConfig::default(), &ShutdownToken::new()).unwrap();
    assert_full_coverage(&store, &report, &[1, 2]);
    assert_eq!(report.merged_clusters, 0);
    assert!(report.store_failures >= 1);
    // The fallback copy of 1 is rejected too; 2 is too small alone.
    assert_eq!(report.outcome(1), Some(Outcome::Failed));
    assert_eq!(report.outcome(2), Some(Outcome::Dropped));
}

#[test]
fn self_intersecting_member_fails_validation_and_falls_back() {
    let mut config = MergeConfig::default();
    config.thresholds.insert(
        HabitatType::Wood,
        TypeThresholds {
            merge_distance: 10.0,
            merge_buffer: 0.0,
        },
    );
    let bowtie = polygon![
        (x: 305.0, y: 0.0),
        (x: 405.0, y: 100.0),
        (x: 405.0, y: 0.0),
        (x: 305.0, y: 100.0),
        (x: 305.0, y: 0.0),
    ];
    let (store, report) = run_with(
        vec![
            candidate(1, HabitatType::Wood, rect(0.0, 0.0, 300.0, 200.0)),
            candidate(2, HabitatType::Wood, bowtie),
        ],
        &config,
    );

    assert_full_coverage(&store, &report, &[1, 2]);
    assert_eq!(report.clusters, 1);
    assert_eq!(report.merged_clusters, 0);
    assert_eq!(report.failures.get(&FailureKind::Validation), Some(&1));
    assert_eq!(report.outcome(1), Some(Outcome::Fallback));
    // Zero signed area, so too small on its own.
    assert_eq!(report.outcome(2), Some(Outcome::Dropped));
}

#[test]
fn configured_exclusions_are_total() {
    let config = MergeConfig {
        exclude_types: vec![HabitatType::None, HabitatType::Urban],
        ..MergeConfig::default()
    };
    let (store, report) = run_with(landscape(), &config);

    assert_eq!(report.outcome(11), None);
    assert!(store
        .habitats()
        .iter()
        .all(|h| h.habitat_type != HabitatType::Urban));
}

#[test]
fn cancellation_before_start_commits_nothing() {
    let store = MemoryStore::new(landscape()).unwrap();
    let token = ShutdownToken::new();
    token.cancel();

    let report = run(&store, &MergeConfig::default(), &token).unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.outcomes.values().all(|o| *o == Outcome::Pending));
    assert!(store.habitats().is_empty());
}

#[test]
fn geodetic_geojson_round_trip() {
    // Two wood parcels near 51.5N, 0.1W: ~300 x 200 m and ~200 x 200 m, ~5 m apart.
    let lon0 = -0.1;
    let lat0: f64 = 51.5;
    let dlon = 1.0 / (111_320.0 * lat0.to_radians().cos());
    let dlat = 1.0 / 111_320.0;
    let ring = |x: f64, w: f64, h: f64| {
        let (x0, x1) = (lon0 + x * dlon, lon0 + (x + w) * dlon);
        let (y0, y1) = (lat0, lat0 + h * dlat);
        format!("[[[{x0},{y0}],[{x1},{y0}],[{x1},{y1}],[{x0},{y1}],[{x0},{y0}]]]")
    };
    let input = format!(
        r#"{{"type":"FeatureCollection","features":[
            {{"type":"Feature","properties":{{"polygon_id":1,"h_type":20}},
              "geometry":{{"type":"Polygon","coordinates":{}}}}},
            {{"type":"Feature","properties":{{"polygon_id":2,"h_type":20}},
              "geometry":{{"type":"Polygon","coordinates":{}}}}}
        ]}}"#,
        ring(0.0, 300.0, 200.0),
        ring(305.0, 200.0, 200.0)
    );

    let dir = tempfile::tempdir().unwrap();
    let in_path = dir.path().join("candidates.geojson");
    let out_path = dir.path().join("habitats.geojson");
    std::fs::File::create(&in_path)
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();

    let dataset = read_candidates_file(&in_path, InputCs::Auto).unwrap();
    assert_eq!(dataset.input_cs, InputCs::Geodetic);
    let store = MemoryStore::new(dataset.candidates).unwrap();
    let report = run(&store, &MergeConfig::default(), &ShutdownToken::new()).unwrap();
    assert_eq!(report.merged_clusters, 1);

    write_habitats_file(&out_path, &store.habitats(), &dataset.frame, false).unwrap();
    assert!(write_habitats_file(&out_path, &store.habitats(), &dataset.frame, false).is_err());

    let out: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(&out_path).unwrap()).unwrap();
    let features = out["features"].as_array().unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["properties"]["polygon_id"], 1);
    assert_eq!(features[0]["properties"]["habitat"], "hab_wood");
    assert_eq!(features[0]["geometry"]["type"], "Polygon");

    // Written back in degrees, near where it came from.
    let first = &features[0]["geometry"]["coordinates"][0][0];
    let lon = first[0].as_f64().unwrap();
    let lat = first[1].as_f64().unwrap();
    assert!((lon - lon0).abs() < 0.01 && (lat - lat0).abs() < 0.01);
}
