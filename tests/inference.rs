mod common;

use common::{CATALOG_XML, TestWorkspace};
use ingest_shape::{
    config::InferenceConfig,
    context::RunContext,
    engine,
    error::IngestError,
    mapping::{Locator, Mapping},
    source::{PreparedInput, SourceFormat, SourceOptions},
    tabular::pk_prefer_from_header,
};

fn infer(path: std::path::PathBuf, options: SourceOptions) -> Result<Mapping, IngestError> {
    let input = PreparedInput::local(path, None, None)?;
    let ctx = RunContext::new(&input.source_name, "test");
    engine::infer_mapping(&input, &options, &InferenceConfig::default(), &ctx)
}

#[test]
fn repeated_items_form_a_collection_and_meta_a_singleton() {
    let ws = TestWorkspace::new();
    let mapping = infer(ws.write("catalog.xml", CATALOG_XML), SourceOptions::default()).unwrap();

    assert_eq!(mapping.format, SourceFormat::Xml);
    assert_eq!(mapping.collections.len(), 2);
    let items = mapping.get("Items").unwrap();
    assert_eq!(items.locator.tree_path(), Some("/Root/Items/Item"));
    assert!(!items.singleton);
    let meta = mapping.get("Meta").unwrap();
    assert!(meta.singleton);
    assert_eq!(meta.locator.tree_path(), Some("/Root/Meta"));
}

#[test]
fn header_preferences_keep_exact_hits_first() {
    let header: Vec<String> = ["ID", "Name", "code"].iter().map(|s| s.to_string()).collect();
    assert_eq!(pk_prefer_from_header(&header), vec!["ID", "code"]);
}

#[test]
fn csv_source_yields_one_header_driven_collection() {
    let ws = TestWorkspace::new();
    let path = ws.write("people.csv", "ID;Name;code\n1;Ann;a\n2;Bob;b\n");
    let options = SourceOptions {
        delimiter: Some(b';'),
        table: Some("people".into()),
        ..Default::default()
    };
    let mapping = infer(path, options).unwrap();
    let rule = mapping.get("people_people").unwrap();
    assert_eq!(rule.pk.prefer, vec!["ID", "code"]);
    assert_eq!(rule.locator, Locator::Csv { delimiter: ';' });
}

#[test]
fn json_document_collections_are_flat_siblings() {
    let ws = TestWorkspace::new();
    let path = ws.write(
        "shop.json",
        r#"{"users": [{"id": 1, "name": "a"}, {"id": 2}], "orders": [{"id": 7, "user": 1}], "meta": {"v": 1}}"#,
    );
    let mapping = infer(path, SourceOptions::default()).unwrap();
    let names: Vec<&str> = mapping.collections.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["shop_orders", "shop_users"]);
    assert!(mapping.collections.values().all(|rule| rule.parent.is_none()));
}

#[test]
fn missing_record_path_is_structural() {
    let ws = TestWorkspace::new();
    let path = ws.write("doc.json", r#"{"data": {"rows": []}}"#);
    let options = SourceOptions {
        records_path: Some("data.missing".into()),
        ..Default::default()
    };
    let err = infer(path, options).unwrap_err();
    assert!(err.is_structural());
}

#[test]
fn tree_without_repeats_or_singletons_has_no_structure() {
    let ws = TestWorkspace::new();
    let path = ws.write("flat.xml", "<Root><A>1</A><A>2</A></Root>");
    let err = infer(path, SourceOptions::default()).unwrap_err();
    assert!(matches!(err, IngestError::NoStructure(_)));
}

#[test]
fn mapping_documents_round_trip_through_yaml() {
    let ws = TestWorkspace::new();
    let mapping = infer(ws.write("catalog.xml", CATALOG_XML), SourceOptions::default()).unwrap();
    let target = ws.path().join("catalog.yaml");
    mapping.save(&target).unwrap();
    let loaded = Mapping::load(&target).unwrap();
    assert_eq!(loaded, mapping);
    assert_eq!(loaded.checksum().unwrap(), mapping.checksum().unwrap());
}

#[test]
fn child_path_must_extend_parent_path() {
    let ws = TestWorkspace::new();
    let path = ws.write(
        "bad.yaml",
        r#"version: 1
source_name: bad
format: xml
collections:
  Items:
    kind: tree
    path: /Root/Items/Item
  Prices:
    kind: tree
    path: /Root/Other/Thing/Prices/Price
    parent: Items
"#,
    );
    let err = Mapping::load(&path).unwrap_err();
    assert!(matches!(err, IngestError::ChildPathMismatch { .. }));
}
