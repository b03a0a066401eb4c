//! Input provider contract and per-collection record streams.
//!
//! The engine only ever sees a local path, a resolved [`SourceFormat`] and a
//! short source name ([`PreparedInput`]). Fetching, caching, and archive
//! extraction belong to whoever builds that value.
//!
//! [`RecordSource::open`] turns one collection rule into a lazy, single-pass
//! stream of [`SourceRecord`]s, independent of how the caller drives it.

use std::{
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{IngestError, Result},
    io_utils, json_shape,
    mapping::{CollectionRule, Locator},
    record::RawRecord,
    tabular, tree,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Xml,
    Json,
    Jsonl,
    Csv,
    Xlsx,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Xml => "xml",
            SourceFormat::Json => "json",
            SourceFormat::Jsonl => "jsonl",
            SourceFormat::Csv => "csv",
            SourceFormat::Xlsx => "xlsx",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "xml" => Some(SourceFormat::Xml),
            "jsonl" | "ndjson" => Some(SourceFormat::Jsonl),
            "json" => Some(SourceFormat::Json),
            "csv" | "tsv" => Some(SourceFormat::Csv),
            "xlsx" => Some(SourceFormat::Xlsx),
            _ => None,
        }
    }

    /// A declared format wins; `auto` or nothing falls back to the extension.
    pub fn resolve(declared: Option<&str>, path: &Path) -> Result<Self> {
        match declared.map(str::trim).filter(|d| !d.eq_ignore_ascii_case("auto")) {
            Some(value) => value.parse(),
            None => Self::from_path(path).ok_or_else(|| {
                IngestError::UnsupportedFormat(
                    path.extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("")
                        .to_string(),
                )
            }),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, SourceFormat::Xml)
    }

    pub fn is_tabular(&self) -> bool {
        matches!(self, SourceFormat::Csv | SourceFormat::Xlsx)
    }
}

impl FromStr for SourceFormat {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xml" => Ok(SourceFormat::Xml),
            "json" => Ok(SourceFormat::Json),
            "jsonl" | "ndjson" => Ok(SourceFormat::Jsonl),
            "csv" => Ok(SourceFormat::Csv),
            "xlsx" => Ok(SourceFormat::Xlsx),
            other => Err(IngestError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local, already-materialized input.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInput {
    pub path: PathBuf,
    pub format: SourceFormat,
    pub source_name: String,
}

impl PreparedInput {
    pub fn local(path: impl Into<PathBuf>, format: Option<&str>, name: Option<&str>) -> Result<Self> {
        let path = path.into();
        let format = SourceFormat::resolve(format, &path)?;
        let source_name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => default_source_name(&path),
        };
        Ok(Self {
            path,
            format,
            source_name,
        })
    }
}

/// File stem, or `source` when the path has none.
pub fn default_source_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("source")
        .to_string()
}

/// Hints that shape how records are read, independent of the mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Dotted JSON path overriding every collection's locator.
    #[serde(default)]
    pub records_path: Option<String>,
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default)]
    pub use_first_sheet: bool,
    #[serde(default)]
    pub delimiter: Option<u8>,
    #[serde(default)]
    pub encoding: Option<String>,
    /// Logical table name for CSV collections.
    #[serde(default)]
    pub table: Option<String>,
}

/// One raw record, with its parent entity for nested tree collections.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub record: RawRecord,
    pub parent: Option<Rc<RawRecord>>,
}

impl SourceRecord {
    pub fn new(record: RawRecord) -> Self {
        Self {
            record,
            parent: None,
        }
    }
}

pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<SourceRecord>> + 'a>;

pub trait RecordSource {
    fn source_name(&self) -> &str;

    fn format(&self) -> SourceFormat;

    /// Lazy stream of the records belonging to `rule`.
    fn open(&self, rule: &CollectionRule) -> Result<RecordStream<'_>>;
}

/// Reads records from a local file according to each rule's locator.
#[derive(Debug, Clone)]
pub struct FileSource {
    input: PreparedInput,
    options: SourceOptions,
}

impl FileSource {
    pub fn new(input: PreparedInput, options: SourceOptions) -> Self {
        Self { input, options }
    }

    fn plain(stream: impl Iterator<Item = Result<RawRecord>> + 'static) -> RecordStream<'static> {
        Box::new(stream.map(|item| item.map(SourceRecord::new)))
    }
}

impl RecordSource for FileSource {
    fn source_name(&self) -> &str {
        &self.input.source_name
    }

    fn format(&self) -> SourceFormat {
        self.input.format
    }

    fn open(&self, rule: &CollectionRule) -> Result<RecordStream<'_>> {
        let path = self.input.path.as_path();
        match &rule.locator {
            Locator::Tree { path: raw } => {
                let tree_path = tree::TreePath::parse(raw)?;
                if tree_path.is_nested() {
                    let stream = tree::open_nested(path, &tree_path)?;
                    Ok(Box::new(stream.map(|item| {
                        item.map(|(record, parent)| SourceRecord {
                            record,
                            parent: Some(parent),
                        })
                    })))
                } else {
                    Ok(Self::plain(tree::open_entities(path, &tree_path)?))
                }
            }
            Locator::Json { path: records_path } => {
                let records_path = self
                    .options
                    .records_path
                    .as_deref()
                    .map(json_shape::to_json_path)
                    .unwrap_or_else(|| records_path.clone());
                let stream = json_shape::open_records(path, self.input.format, &records_path)?;
                Ok(Self::plain(stream))
            }
            Locator::Csv { delimiter } => {
                let delimiter = self.options.delimiter.unwrap_or_else(|| {
                    if delimiter.is_ascii() {
                        *delimiter as u8
                    } else {
                        io_utils::resolve_input_delimiter(path, None)
                    }
                });
                let encoding = io_utils::resolve_encoding(self.options.encoding.as_deref())?;
                Ok(Self::plain(tabular::CsvRecords::open(path, delimiter, encoding)?))
            }
            Locator::Xlsx {
                sheet,
                use_first_sheet,
            } => {
                let sheet = sheet.as_deref().or(self.options.sheet.as_deref());
                Ok(Self::plain(tabular::XlsxRecords::open(
                    path,
                    sheet,
                    *use_first_sheet,
                )?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_guessing_and_override() {
        assert_eq!(
            SourceFormat::resolve(None, Path::new("a/b.NDJSON")).unwrap(),
            SourceFormat::Jsonl
        );
        assert_eq!(
            SourceFormat::resolve(Some("json"), Path::new("data.txt")).unwrap(),
            SourceFormat::Json
        );
        assert_eq!(
            SourceFormat::resolve(Some("auto"), Path::new("x.xlsx")).unwrap(),
            SourceFormat::Xlsx
        );
        assert!(matches!(
            SourceFormat::resolve(None, Path::new("x.parquet")),
            Err(IngestError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn source_name_defaults_to_stem() {
        let input = PreparedInput::local("/tmp/feeds/products.xml", None, None).unwrap();
        assert_eq!(input.source_name, "products");
        assert_eq!(input.format, SourceFormat::Xml);
        let named = PreparedInput::local("/tmp/x.csv", None, Some("  catalog ")).unwrap();
        assert_eq!(named.source_name, "catalog");
    }
}
