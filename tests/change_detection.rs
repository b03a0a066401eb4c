mod common;

use chrono::{Duration, Utc};
use common::TestWorkspace;
use ingest_shape::{
    change::{
        ChangeDetector, Checkpoint, Decision, JsonlMetadataStore, MetadataStore, ProcessReason,
        RunObservation, SourceMetadata,
    },
    context::RunContext,
    source::SourceFormat,
};

fn seeded_store(ws: &TestWorkspace) -> JsonlMetadataStore {
    let mut store = JsonlMetadataStore::new(ws.path().join("source_metadata.jsonl"));
    let ctx = RunContext::new("orders", "sales").with_run_id("ingest_20240101_000000_aaaaaaaa");
    let row = SourceMetadata::for_run(
        None,
        &ctx,
        RunObservation {
            source_type: Some("file".into()),
            format: Some(SourceFormat::Csv),
            preliminary_checksum: Some("P1".into()),
            exact_checksum: Some("H1".into()),
            mapping_checksum: Some("M1".into()),
            size_bytes: Some(42),
            ..Default::default()
        },
        Utc::now() - Duration::days(1),
    );
    store.append(&[row]).unwrap();
    store
}

#[test]
fn exact_checkpoint_compares_content_and_mapping() {
    let ws = TestWorkspace::new();
    let store = seeded_store(&ws);
    let detector = ChangeDetector::new(&store, false);
    let ctx = RunContext::new("orders", "sales");

    assert_eq!(
        detector.check(&ctx, Checkpoint::Exact, Some("H1"), Some("M1")),
        Decision::Skip
    );
    assert!(!detector.check(&ctx, Checkpoint::Exact, Some("H2"), Some("M1")).is_skip());
    assert!(!detector.check(&ctx, Checkpoint::Exact, Some("H1"), Some("M2")).is_skip());
    assert!(detector.check(&ctx, Checkpoint::Preliminary, Some("P1"), Some("M1")).is_skip());
}

#[test]
fn forced_runs_are_never_skipped() {
    let ws = TestWorkspace::new();
    let store = seeded_store(&ws);
    let detector = ChangeDetector::new(&store, true);
    let ctx = RunContext::new("orders", "sales");
    assert_eq!(
        detector.check(&ctx, Checkpoint::Exact, Some("H1"), Some("M1")),
        Decision::Process(ProcessReason::Forced)
    );
}

#[test]
fn history_is_scoped_by_dataset() {
    let ws = TestWorkspace::new();
    let store = seeded_store(&ws);
    let detector = ChangeDetector::new(&store, false);
    let other = RunContext::new("orders", "archive");
    assert_eq!(
        detector.check(&other, Checkpoint::Exact, Some("H1"), Some("M1")),
        Decision::Process(ProcessReason::NoHistory)
    );
}

#[test]
fn unchanged_rerun_keeps_first_timestamp_and_run_id() {
    let ws = TestWorkspace::new();
    let mut store = seeded_store(&ws);
    let previous = store.latest("orders", "sales").unwrap().unwrap();
    let ctx = RunContext::new("orders", "sales");
    let row = SourceMetadata::for_run(
        Some(&previous),
        &ctx,
        RunObservation {
            exact_checksum: Some("H1".into()),
            mapping_checksum: Some("M1".into()),
            ..Default::default()
        },
        Utc::now(),
    );
    assert_eq!(row.first_ingest_timestamp, previous.first_ingest_timestamp);
    assert_eq!(row.last_run_id, previous.last_run_id);
    store.append(&[row.clone()]).unwrap();

    let latest = store.latest("orders", "sales").unwrap().unwrap();
    assert_eq!(latest, row);
    // the newer row has no preliminary checksum; the older one still answers
    let stored = store.latest_checksums("orders", "sales").unwrap().unwrap();
    assert_eq!(stored.preliminary.as_deref(), Some("P1"));
}

#[test]
fn timestamps_serialize_as_rfc3339() {
    let ws = TestWorkspace::new();
    seeded_store(&ws);
    let line = std::fs::read_to_string(ws.path().join("source_metadata.jsonl")).unwrap();
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    let stamp = value["first_ingest_timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    assert_eq!(value["format"], "csv");
    assert_eq!(value["dataset"], "sales");
}
