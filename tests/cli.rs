mod common;

use assert_cmd::Command;
use common::{CATALOG_XML, TestWorkspace};
use ingest_shape::mapping::Mapping;
use predicates::str::contains;

fn ingest_shape() -> Command {
    Command::cargo_bin("ingest-shape").expect("binary exists")
}

#[test]
fn infer_writes_a_loadable_mapping() {
    let ws = TestWorkspace::new();
    let input = ws.write("catalog.xml", CATALOG_XML);
    let output = ws.path().join("catalog.yaml");
    ingest_shape()
        .args([
            "infer",
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
        ])
        .assert()
        .success();

    let mapping = Mapping::load(&output).expect("load mapping");
    assert_eq!(mapping.source_name, "catalog");
    assert!(mapping.collections.contains_key("Items"));
    assert!(mapping.get("Meta").unwrap().singleton);
}

#[test]
fn infer_prints_yaml_without_output() {
    let ws = TestWorkspace::new();
    let input = ws.write("people.csv", "ID,Name,code\n1,Ann,a\n");
    ingest_shape()
        .args(["infer", "-i", input.to_str().unwrap(), "--table", "people"])
        .assert()
        .success()
        .stdout(contains("people_people"))
        .stdout(contains("kind: csv"));
}

#[test]
fn normalize_writes_tables_and_raw_stream() {
    let ws = TestWorkspace::new();
    let input = ws.write("catalog.xml", CATALOG_XML);
    let out = ws.path().join("out");
    ingest_shape()
        .args([
            "normalize",
            "-i",
            input.to_str().unwrap(),
            "-o",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    let items = ws.read_jsonl(&out.join("catalog_Items.jsonl"));
    assert_eq!(items.len(), 5);
    assert_eq!(items[0]["_pk"], "1");
    assert_eq!(items[0]["attr__id"], "1");
    assert_eq!(items[0]["code"], "A");
    let meta = ws.read_jsonl(&out.join("catalog_Meta.jsonl"));
    assert_eq!(meta.len(), 1);
    let raw = ws.read_jsonl(&out.join("raw_ingest.jsonl"));
    assert_eq!(raw.len(), 6);
    assert_eq!(raw[0]["collection"], "Items");
    assert_eq!(raw[0]["__source_name"], "catalog");
}

#[test]
fn normalize_with_pk_override_hashes_fields() {
    let ws = TestWorkspace::new();
    let input = ws.write("events.jsonl", "{\"id\": 1, \"kind\": \"a\"}\n\n{\"id\": 2, \"kind\": \"b\"}\n");
    let out = ws.path().join("out");
    ingest_shape()
        .args([
            "normalize",
            "-i",
            input.to_str().unwrap(),
            "-o",
            out.to_str().unwrap(),
            "--pk-fields",
            "kind,id",
            "--no-raw",
        ])
        .assert()
        .success();

    let rows = ws.read_jsonl(&out.join("events_events_records.jsonl"));
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0]["_pk"],
        ingest_shape::hashing::text_hash("a|1").as_str()
    );
    assert!(!out.join("raw_ingest.jsonl").exists());
}

#[test]
fn check_skips_after_a_recorded_run() {
    let ws = TestWorkspace::new();
    let input = ws.write("catalog.xml", CATALOG_XML);
    let mapping = ws.path().join("catalog.yaml");
    let store = ws.path().join("meta.jsonl");
    ingest_shape()
        .args([
            "infer",
            "-i",
            input.to_str().unwrap(),
            "-o",
            mapping.to_str().unwrap(),
        ])
        .assert()
        .success();
    let args = [
        "check",
        "-i",
        input.to_str().unwrap(),
        "-m",
        mapping.to_str().unwrap(),
        "--store",
        store.to_str().unwrap(),
        "--dataset",
        "demo",
    ];

    ingest_shape()
        .args(args)
        .arg("--record")
        .assert()
        .success()
        .stdout(contains("process"));
    ingest_shape()
        .args(args)
        .assert()
        .success()
        .stdout(contains("skip"));
    ingest_shape()
        .args(args)
        .arg("--force")
        .assert()
        .success()
        .stdout(contains("process"));
}

#[test]
fn check_without_mapping_never_skips() {
    let ws = TestWorkspace::new();
    let input = ws.write("catalog.xml", CATALOG_XML);
    let store = ws.path().join("meta.jsonl");
    for _ in 0..2 {
        ingest_shape()
            .args([
                "check",
                "-i",
                input.to_str().unwrap(),
                "--store",
                store.to_str().unwrap(),
                "--record",
            ])
            .assert()
            .success()
            .stdout(contains("process"));
    }
}

#[test]
fn unsupported_format_fails_cleanly() {
    let ws = TestWorkspace::new();
    let input = ws.write("data.parquet", "PAR1");
    ingest_shape()
        .args(["infer", "-i", input.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("error:"));
}
