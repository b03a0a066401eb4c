//! Tabular sources: CSV files and XLSX worksheets.
//!
//! Tabular inference never samples values. Each file (or sheet) is one flat
//! collection whose PK-preference list comes from header names alone.
//!
//! Spreadsheets are read straight from the package: `xl/workbook.xml` and its
//! relationships resolve sheet names to parts, `xl/sharedStrings.xml` supplies
//! string cells, and each cell's `r` reference places it in the right column
//! even when empty cells are omitted.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Read},
    path::Path,
    vec,
};

use encoding_rs::Encoding;
use log::{debug, info};
use quick_xml::{Reader, events::Event};
use serde_json::Number;
use zip::ZipArchive;

use crate::{
    error::{IngestError, Result},
    io_utils,
    mapping::{CollectionRule, Locator, Mapping, PkRule},
    pk_rank::prefer_from_names,
    record::{RawRecord, RawValue, Scalar},
    source::SourceFormat,
};

pub const DEFAULT_TABLE: &str = "data";
const MAX_PART_BYTES: u64 = 256 * 1024 * 1024;

/// Header-derived PK preferences; empty header names are ignored.
pub fn pk_prefer_from_header(header: &[String]) -> Vec<String> {
    let names: Vec<&str> = header
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .collect();
    prefer_from_names(&names)
}

fn collection_name(source_name: &str, table: Option<&str>) -> String {
    format!("{source_name}_{}", table.unwrap_or(DEFAULT_TABLE))
}

/// Builds a record from parallel header/value slices.
/// Empty header names drop their column; blank values become null.
fn row_record<I>(header: &[String], values: I) -> RawRecord
where
    I: IntoIterator<Item = Option<Scalar>>,
{
    let mut record = RawRecord::new();
    for (name, value) in header.iter().zip(values) {
        if name.is_empty() {
            continue;
        }
        let value = match value {
            Some(Scalar::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Scalar::Null
                } else {
                    Scalar::String(trimmed.to_string())
                }
            }
            Some(other) => other,
            None => Scalar::Null,
        };
        record.insert(name.clone(), RawValue::Scalar(value));
    }
    record
}

fn is_blank_row(record: &RawRecord) -> bool {
    record
        .iter()
        .all(|(_, v)| v.as_scalar().is_none_or(Scalar::is_null))
}

// ---------------------------------------------------------------- CSV

pub fn infer_csv_mapping(
    path: &Path,
    source_name: &str,
    table: Option<&str>,
    delimiter: u8,
    encoding: &'static Encoding,
) -> Result<Mapping> {
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
    let header = io_utils::reader_headers(&mut reader, encoding)?;
    let prefer = pk_prefer_from_header(&header);
    info!(
        "[{source_name}] CSV header: {} column(s), delimiter {}, PK candidates {:?}",
        header.len(),
        io_utils::printable_delimiter(delimiter),
        prefer
    );
    let mut mapping = Mapping::new(source_name, SourceFormat::Csv);
    mapping.insert_unique(
        &collection_name(source_name, table),
        CollectionRule::new(
            Locator::Csv {
                delimiter: delimiter as char,
            },
            PkRule { prefer },
        ),
    );
    Ok(mapping)
}

pub struct CsvRecords {
    reader: csv::Reader<Box<dyn Read>>,
    header: Vec<String>,
    encoding: &'static Encoding,
    record: csv::ByteRecord,
}

impl CsvRecords {
    pub fn open(path: &Path, delimiter: u8, encoding: &'static Encoding) -> Result<Self> {
        let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
        let header = io_utils::reader_headers(&mut reader, encoding)?
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();
        Ok(Self {
            reader,
            header,
            encoding,
            record: csv::ByteRecord::new(),
        })
    }
}

impl Iterator for CsvRecords {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(false) => return None,
                Ok(true) => {}
                Err(err) => return Some(Err(err.into())),
            }
            let values = match io_utils::decode_record(&self.record, self.encoding) {
                Ok(values) => values,
                Err(err) => return Some(Err(err)),
            };
            let record = row_record(
                &self.header,
                values.into_iter().map(|v| Some(Scalar::String(v))),
            );
            if !is_blank_row(&record) {
                return Some(Ok(record));
            }
        }
    }
}

// ---------------------------------------------------------------- XLSX

fn read_part<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut bytes = Vec::new();
    entry.take(MAX_PART_BYTES + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > MAX_PART_BYTES {
        return Err(IngestError::UnsupportedFormat(format!(
            "spreadsheet part {name} exceeds {MAX_PART_BYTES} bytes"
        )));
    }
    Ok(Some(bytes))
}

fn xml_reader(bytes: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);
    reader
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        (attr.key.local_name().as_ref() == local)
            .then(|| attr.unescape_value().ok().map(|v| v.into_owned()))
            .flatten()
    })
}

/// Column index from a cell reference such as `AB12` (zero-based).
pub fn column_index(reference: &str) -> Option<usize> {
    let letters: String = reference
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut index = 0usize;
    for c in letters.chars() {
        index = index * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(index - 1)
}

struct SheetEntry {
    name: String,
    part: String,
}

fn parse_sheet_list(workbook: &[u8]) -> Result<Vec<(String, Option<String>)>> {
    let mut reader = xml_reader(workbook);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                if let Some(name) = attribute(&e, b"name") {
                    sheets.push((name, attribute(&e, b"id")));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

fn parse_relationships(rels: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = xml_reader(rels);
    let mut buf = Vec::new();
    let mut targets = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attribute(&e, b"Id"), attribute(&e, b"Target")) {
                    targets.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(targets)
}

fn part_path(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    }
}

fn parse_shared_strings(bytes: &[u8]) -> Result<Vec<String>> {
    let mut reader = xml_reader(bytes);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(t) if in_text => {
                if let Some(text) = current.as_mut() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(current.take().unwrap_or_default()),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Default)]
struct PendingCell {
    column: Option<usize>,
    kind: Option<String>,
    value: String,
}

fn cell_value(cell: &PendingCell, shared: &[String]) -> Option<Scalar> {
    let raw = cell.value.as_str();
    match cell.kind.as_deref() {
        Some("s") => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i))
            .map(|s| Scalar::String(s.clone())),
        Some("inlineStr") | Some("str") | Some("e") => Some(Scalar::String(raw.to_string())),
        Some("b") => Some(Scalar::Bool(raw.trim() == "1")),
        _ => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else if let Ok(int) = trimmed.parse::<i64>() {
                Some(Scalar::Number(Number::from(int)))
            } else if let Some(float) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
                Some(Scalar::Number(float))
            } else {
                Some(Scalar::String(trimmed.to_string()))
            }
        }
    }
}

/// All rows of a worksheet part, cells placed by reference.
fn parse_sheet_rows(bytes: &[u8], shared: &[String]) -> Result<Vec<Vec<Option<Scalar>>>> {
    let mut reader = xml_reader(bytes);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Option<Vec<Option<Scalar>>> = None;
    let mut cell: Option<PendingCell> = None;
    let mut capture = false;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => row = Some(Vec::new()),
                b"c" => {
                    cell = Some(PendingCell {
                        column: attribute(&e, b"r").as_deref().and_then(column_index),
                        kind: attribute(&e, b"t"),
                        value: String::new(),
                    })
                }
                b"v" | b"t" => capture = cell.is_some(),
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"row" => rows.push(Vec::new()),
            Event::Text(t) if capture => {
                if let Some(pending) = cell.as_mut() {
                    pending.value.push_str(&t.unescape()?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    if let (Some(pending), Some(cells)) = (cell.take(), row.as_mut()) {
                        let index = pending.column.unwrap_or(cells.len());
                        let value = cell_value(&pending, shared);
                        if cells.len() <= index {
                            cells.resize(index + 1, None);
                        }
                        cells[index] = value;
                    }
                }
                b"row" => rows.extend(row.take()),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

/// An opened spreadsheet package.
pub struct Workbook {
    archive: ZipArchive<BufReader<File>>,
    sheets: Vec<SheetEntry>,
    shared: Vec<String>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self> {
        let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
        let workbook = read_part(&mut archive, "xl/workbook.xml")?.ok_or_else(|| {
            IngestError::UnsupportedFormat(format!("{} has no xl/workbook.xml", path.display()))
        })?;
        let rels = match read_part(&mut archive, "xl/_rels/workbook.xml.rels")? {
            Some(bytes) => parse_relationships(&bytes)?,
            None => HashMap::new(),
        };
        let sheets = parse_sheet_list(&workbook)?
            .into_iter()
            .enumerate()
            .map(|(i, (name, rel_id))| {
                let part = rel_id
                    .and_then(|id| rels.get(&id))
                    .map(|target| part_path(target))
                    .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", i + 1));
                SheetEntry { name, part }
            })
            .collect();
        let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
            Some(bytes) => parse_shared_strings(&bytes)?,
            None => Vec::new(),
        };
        Ok(Self {
            archive,
            sheets,
            shared,
        })
    }

    /// Requested sheet, or the first one when no name is given.
    pub fn resolve_sheet(&self, sheet: Option<&str>, use_first_sheet: bool) -> Result<String> {
        let wanted = if use_first_sheet { None } else { sheet };
        let entry = match wanted {
            Some(name) => self.sheets.iter().find(|s| s.name == name),
            None => self.sheets.first(),
        };
        entry.map(|s| s.name.clone()).ok_or_else(|| {
            IngestError::UnknownCollection(format!("sheet {}", wanted.unwrap_or("<first>")))
        })
    }

    pub fn rows(&mut self, sheet: &str) -> Result<Vec<Vec<Option<Scalar>>>> {
        let part = self
            .sheets
            .iter()
            .find(|s| s.name == sheet)
            .map(|s| s.part.clone())
            .ok_or_else(|| IngestError::UnknownCollection(format!("sheet {sheet}")))?;
        let bytes = read_part(&mut self.archive, &part)?.ok_or_else(|| {
            IngestError::UnsupportedFormat(format!("missing worksheet part {part}"))
        })?;
        parse_sheet_rows(&bytes, &self.shared)
    }
}

fn cell_text(cell: &Option<Scalar>) -> String {
    cell.as_ref()
        .and_then(Scalar::as_key_string)
        .unwrap_or_default()
}

/// Splits rows at the first row with any non-empty cell, which is the header.
fn split_header(
    rows: Vec<Vec<Option<Scalar>>>,
) -> (Vec<String>, vec::IntoIter<Vec<Option<Scalar>>>) {
    let mut rows = rows.into_iter();
    while let Some(row) = rows.next() {
        let header: Vec<String> = row.iter().map(cell_text).collect();
        if header.iter().any(|h| !h.is_empty()) {
            return (header, rows);
        }
    }
    (Vec::new(), rows)
}

pub fn infer_xlsx_mapping(
    path: &Path,
    source_name: &str,
    sheet: Option<&str>,
    use_first_sheet: bool,
) -> Result<Mapping> {
    let mut workbook = Workbook::open(path)?;
    let sheet_name = workbook.resolve_sheet(sheet, use_first_sheet)?;
    let (header, _) = split_header(workbook.rows(&sheet_name)?);
    let prefer = pk_prefer_from_header(&header);
    info!(
        "[{source_name}] Sheet '{sheet_name}': {} header cell(s), PK candidates {:?}",
        header.iter().filter(|h| !h.is_empty()).count(),
        prefer
    );
    let mut mapping = Mapping::new(source_name, SourceFormat::Xlsx);
    mapping.insert_unique(
        &collection_name(source_name, Some(&sheet_name)),
        CollectionRule::new(
            Locator::Xlsx {
                sheet: Some(sheet_name),
                use_first_sheet,
            },
            PkRule { prefer },
        ),
    );
    Ok(mapping)
}

/// Data rows of one sheet; fully blank rows are skipped.
pub struct XlsxRecords {
    sheet: String,
    header: Vec<String>,
    rows: vec::IntoIter<Vec<Option<Scalar>>>,
}

impl XlsxRecords {
    pub fn open(path: &Path, sheet: Option<&str>, use_first_sheet: bool) -> Result<Self> {
        let mut workbook = Workbook::open(path)?;
        let sheet = workbook.resolve_sheet(sheet, use_first_sheet)?;
        let (header, rows) = split_header(workbook.rows(&sheet)?);
        debug!("Sheet '{sheet}' header: {header:?}");
        Ok(Self {
            sheet,
            header,
            rows,
        })
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }
}

impl Iterator for XlsxRecords {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        for row in self.rows.by_ref() {
            let record = row_record(&self.header, row.into_iter().chain(std::iter::repeat(None)));
            if !is_blank_row(&record) {
                return Some(Ok(record));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn header_preferences() {
        assert_eq!(pk_prefer_from_header(&strings(&["ID", "Name", "code"])), vec!["ID", "code"]);
        assert_eq!(pk_prefer_from_header(&strings(&["", " pk ", "x"])), vec!["pk"]);
    }

    #[test]
    fn column_references() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AA3"), Some(26));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn csv_rows_trim_and_null_blanks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "id,,name\n 1 ,x,  \n,,\n2,y,Bob\n").unwrap();
        let records: Vec<RawRecord> = CsvRecords::open(&path, b',', encoding_rs::UTF_8)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].to_json(), serde_json::json!({"id": "1", "name": null}));
        assert_eq!(records[1].keys().collect::<Vec<_>>(), vec!["id", "name"]);
    }

    fn write_workbook(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        let parts = [
            (
                "xl/workbook.xml",
                r#"<workbook xmlns:r="urn:r"><sheets><sheet name="People" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
            ),
            (
                "xl/_rels/workbook.xml.rels",
                r#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/></Relationships>"#,
            ),
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>Code</t></si><si><t>Name</t></si><si><r><t>Al</t></r><r><t>ice</t></r></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData>
<row r="1"></row>
<row r="2"><c r="A2" t="s"><v>0</v></c><c r="C2" t="s"><v>1</v></c><c r="D2"/></row>
<row r="3"><c r="A3"><v>7</v></c><c r="C3" t="s"><v>2</v></c><c r="D3"><v>9</v></c></row>
<row r="4"><c r="A4"><v></v></c></row>
<row r="5"><c r="A5"><v>1.5</v></c><c r="C5" t="inlineStr"><is><t>Bob</t></is></c></row>
</sheetData></worksheet>"#,
            ),
        ];
        for (name, body) in parts {
            zip.start_file(name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn xlsx_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("book.xlsx");
        write_workbook(&path);

        let mapping = infer_xlsx_mapping(&path, "book", None, false).unwrap();
        let rule = mapping.get("book_People").expect("sheet collection");
        assert_eq!(rule.pk.prefer, vec!["Code"]);

        let records = XlsxRecords::open(&path, None, true).unwrap();
        assert_eq!(records.sheet(), "People");
        let rows: Vec<RawRecord> = records.collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].to_json(), serde_json::json!({"Code": 7, "Name": "Alice"}));
        assert_eq!(rows[1].to_json(), serde_json::json!({"Code": 1.5, "Name": "Bob"}));
    }

    #[test]
    fn unknown_sheet_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("book.xlsx");
        write_workbook(&path);
        assert!(XlsxRecords::open(&path, Some("Nope"), false).is_err());
    }
}
