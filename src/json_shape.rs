//! JSON and JSON-lines shape inference and record streams.
//!
//! Collections found in a JSON document are always flat siblings; there is no
//! parent/child linkage. Paths are `$` for the whole document or `$.a.b` for
//! a dotted object path.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    vec,
};

use log::{debug, info};
use serde_json::Value as JsonValue;

use crate::{
    config::InferenceConfig,
    error::{IngestError, Result},
    mapping::{CollectionRule, Mapping},
    pk_rank::{base_prefer, prefer_from_names},
    record::RawRecord,
    source::SourceFormat,
};

pub const ROOT_PATH: &str = "$";

/// `"$.a.b"`, `"a.b"` -> `["a", "b"]`; `"$"` -> `[]`.
fn path_segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim();
    let trimmed = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);
    trimmed.split('.').filter(|s| !s.is_empty()).collect()
}

pub fn to_json_path(dotted: &str) -> String {
    let segments = path_segments(dotted);
    if segments.is_empty() {
        ROOT_PATH.to_string()
    } else {
        format!("$.{}", segments.join("."))
    }
}

/// Resolves a dotted path through nested objects.
pub fn resolve_path<'a>(document: &'a JsonValue, path: &str) -> Result<&'a JsonValue> {
    let mut current = document;
    for segment in path_segments(path) {
        current = current
            .as_object()
            .and_then(|map| map.get(segment))
            .ok_or_else(|| IngestError::RecordPathNotFound(path.to_string()))?;
    }
    Ok(current)
}

fn object_keys(value: &JsonValue) -> Option<Vec<&str>> {
    value
        .as_object()
        .map(|map| map.keys().map(String::as_str).collect())
}

/// Key preferences from the first object found in `value`.
fn prefer_from_value(value: &JsonValue) -> Vec<String> {
    let first_object = match value {
        JsonValue::Array(items) => items.iter().find(|item| item.is_object()),
        JsonValue::Object(_) => Some(value),
        _ => None,
    };
    let found = first_object
        .and_then(object_keys)
        .map(|keys| prefer_from_names(&keys))
        .unwrap_or_default();
    if found.is_empty() { base_prefer() } else { found }
}

fn is_record_list(value: &JsonValue, scan_limit: usize) -> bool {
    match value {
        JsonValue::Array(items) => {
            !items.is_empty() && items.iter().take(scan_limit).all(JsonValue::is_object)
        }
        _ => false,
    }
}

pub fn load_document(path: &Path) -> Result<JsonValue> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Applies the shape rules to an already-parsed document.
pub fn infer_document_mapping(
    document: &JsonValue,
    source_name: &str,
    records_path: Option<&str>,
    config: &InferenceConfig,
) -> Result<Mapping> {
    let mut mapping = Mapping::new(source_name, SourceFormat::Json);

    if let Some(dotted) = records_path.filter(|p| !p.trim().is_empty()) {
        let value = resolve_path(document, dotted)?;
        let rule = CollectionRule::json(to_json_path(dotted), prefer_from_value(value));
        mapping.insert_unique(&format!("{source_name}_records"), rule);
        return Ok(mapping);
    }

    match document {
        JsonValue::Array(_) => {
            let rule = CollectionRule::json(ROOT_PATH, prefer_from_value(document));
            mapping.insert_unique(&format!("{source_name}_records"), rule);
        }
        JsonValue::Object(map) => {
            for (key, value) in map {
                if is_record_list(value, config.json_scan_limit) {
                    let rule =
                        CollectionRule::json(format!("$.{key}"), prefer_from_value(value));
                    let name = mapping.insert_unique(&format!("{source_name}_{key}"), rule);
                    debug!("[{source_name}] JSON collection '{name}' at $.{key}");
                }
            }
            if mapping.collections.is_empty() {
                let rule = CollectionRule::json(ROOT_PATH, prefer_from_value(document));
                mapping.insert_unique(&format!("{source_name}_root"), rule);
            }
        }
        _ => {
            let rule = CollectionRule::json(ROOT_PATH, Vec::new());
            mapping.insert_unique(&format!("{source_name}_value"), rule);
        }
    }
    Ok(mapping)
}

pub fn infer_json_mapping(
    path: &Path,
    source_name: &str,
    records_path: Option<&str>,
    config: &InferenceConfig,
) -> Result<Mapping> {
    let document = load_document(path)?;
    let mapping = infer_document_mapping(&document, source_name, records_path, config)?;
    info!(
        "[{source_name}] JSON shape: {} collection(s)",
        mapping.collections.len()
    );
    Ok(mapping)
}

/// One collection named for the source; no structural scan.
pub fn infer_jsonl_mapping(source_name: &str) -> Mapping {
    let mut mapping = Mapping::new(source_name, SourceFormat::Jsonl);
    mapping.insert_unique(
        &format!("{source_name}_records"),
        CollectionRule::json(ROOT_PATH, base_prefer()),
    );
    mapping
}

/// Records at `path`: list items (non-objects wrapped), a single object, or a
/// wrapped scalar.
pub fn records_at(document: JsonValue, path: &str) -> Result<Vec<RawRecord>> {
    let mut document = document;
    let mut current = &mut document;
    for segment in path_segments(path) {
        current = current
            .as_object_mut()
            .and_then(|map| map.get_mut(segment))
            .ok_or_else(|| IngestError::RecordPathNotFound(path.to_string()))?;
    }
    let value = current.take();
    Ok(match value {
        JsonValue::Array(items) => items.into_iter().map(RawRecord::from_json).collect(),
        other => vec![RawRecord::from_json(other)],
    })
}

/// Stream over a JSON-lines file; blank lines are skipped.
pub struct JsonLinesRecords<R: BufRead> {
    lines: std::io::Lines<R>,
    line_number: usize,
}

impl<R: BufRead> JsonLinesRecords<R> {
    pub fn new(input: R) -> Self {
        Self {
            lines: input.lines(),
            line_number: 0,
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesRecords<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            self.line_number += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str::<JsonValue>(trimmed)
                    .map(RawRecord::from_json)
                    .map_err(|err| {
                        debug!("Invalid JSON on line {}", self.line_number);
                        IngestError::Json(err)
                    }),
            );
        }
    }
}

pub enum JsonRecords {
    Lines(JsonLinesRecords<BufReader<File>>),
    Document(vec::IntoIter<RawRecord>),
}

impl Iterator for JsonRecords {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            JsonRecords::Lines(lines) => lines.next(),
            JsonRecords::Document(records) => records.next().map(Ok),
        }
    }
}

pub fn open_records(path: &Path, format: SourceFormat, records_path: &str) -> Result<JsonRecords> {
    match format {
        SourceFormat::Jsonl => Ok(JsonRecords::Lines(JsonLinesRecords::new(BufReader::new(
            File::open(path)?,
        )))),
        _ => {
            let document = load_document(path)?;
            Ok(JsonRecords::Document(
                records_at(document, records_path)?.into_iter(),
            ))
        }
    }
}
