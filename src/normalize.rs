//! Record normalization into semi-flat rows.
//!
//! Column routing:
//!
//! | Raw value | Column(s) |
//! |---|---|
//! | scalar field `f` | `f` |
//! | text-only object (`#text`, optional `@`) | `f` = text, `json__f__attrs` = attributes |
//! | any other object or list | `json__f` (compact JSON) |
//! | tree attributes | `attr__<name>` |
//! | tree element text | `text` |
//!
//! Every row also carries `_pk` and `raw_json`, the canonical serialization of
//! the whole record.

use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::{
    config::InferenceConfig,
    error::Result,
    hashing,
    mapping::{CollectionRule, Locator, Mapping},
    pk_rank::candidate_value,
    record::{ATTR_SLOT, RawRecord, RawValue, Scalar, TEXT_SLOT},
    source::SourceFormat,
};

pub const PK_COLUMN: &str = "_pk";
pub const RAW_JSON_COLUMN: &str = "raw_json";
pub const TEXT_COLUMN: &str = "text";
pub const PARENT_COLLECTION_COLUMN: &str = "_parent_collection";
pub const SOURCE_NAME_COLUMN: &str = "__source_name";
pub const JSON_RECORDS_PATH_COLUMN: &str = "__json_records_path";
pub const XLSX_SHEET_COLUMN: &str = "__xlsx_sheet";

/// Three-tier key derivation.
///
/// 1. Override fields given: their trimmed non-empty values joined by the
///    separator and hashed, or the content hash when none has a value. The
///    preference list is not consulted.
/// 2. Otherwise the first preference with a value, verbatim.
/// 3. Otherwise the content hash of the whole record.
pub fn derive_pk(
    record: &RawRecord,
    prefer: &[String],
    pk_override: Option<&[String]>,
    separator: &str,
) -> String {
    if let Some(fields) = pk_override.filter(|f| !f.is_empty()) {
        let values = fields.iter().map(|field| candidate_value(record, field));
        return hashing::fields_hash(values, separator)
            .unwrap_or_else(|| hashing::content_hash(record));
    }
    prefer
        .iter()
        .find_map(|field| candidate_value(record, field))
        .unwrap_or_else(|| hashing::content_hash(record))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParentLink {
    /// Column holding the parent key, `_parent_pk` by default.
    pub column: String,
    pub pk: String,
    pub collection: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub pk: String,
    pub raw_json: String,
    columns: Vec<(String, Scalar)>,
    pub parent: Option<ParentLink>,
}

impl NormalizedRow {
    fn new(pk: String, raw_json: String) -> Self {
        Self {
            pk,
            raw_json,
            columns: Vec::new(),
            parent: None,
        }
    }

    fn set(&mut self, name: impl Into<String>, value: Scalar) {
        let name = name.into();
        match self.columns.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name, value)),
        }
    }

    /// Value of any column, including `_pk`, `raw_json` and parent columns.
    pub fn get(&self, name: &str) -> Option<Scalar> {
        match name {
            PK_COLUMN => Some(Scalar::String(self.pk.clone())),
            RAW_JSON_COLUMN => Some(Scalar::String(self.raw_json.clone())),
            PARENT_COLLECTION_COLUMN => self
                .parent
                .as_ref()
                .map(|p| p.collection.clone().map(Scalar::String).unwrap_or(Scalar::Null)),
            _ => {
                if let Some(parent) = self.parent.as_ref().filter(|p| p.column == name) {
                    return Some(Scalar::String(parent.pk.clone()));
                }
                self.columns
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
            }
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Serialize for NormalizedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let extra = if self.parent.is_some() { 2 } else { 0 };
        let mut map = serializer.serialize_map(Some(2 + self.columns.len() + extra))?;
        map.serialize_entry(PK_COLUMN, &self.pk)?;
        map.serialize_entry(RAW_JSON_COLUMN, &self.raw_json)?;
        for (k, v) in &self.columns {
            map.serialize_entry(k, v)?;
        }
        if let Some(parent) = &self.parent {
            map.serialize_entry(&parent.column, &parent.pk)?;
            map.serialize_entry(PARENT_COLLECTION_COLUMN, &parent.collection)?;
        }
        map.end()
    }
}

/// Audit row carrying the untouched record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRow {
    pub collection: String,
    pub path: String,
    pub raw_json: String,
    #[serde(rename = "__source_name")]
    pub source_name: String,
    #[serde(rename = "_parent_raw_json", skip_serializing_if = "Option::is_none")]
    pub parent_raw_json: Option<String>,
    #[serde(rename = "_parent_path", skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
}

pub struct Normalizer<'a> {
    mapping: &'a Mapping,
    config: &'a InferenceConfig,
    pk_override: Option<Vec<String>>,
}

impl<'a> Normalizer<'a> {
    pub fn new(mapping: &'a Mapping, config: &'a InferenceConfig) -> Self {
        Self {
            mapping,
            config,
            pk_override: None,
        }
    }

    /// Fields whose joined values key every row, ahead of the preference lists.
    pub fn with_pk_override(mut self, fields: Vec<String>) -> Self {
        self.pk_override = (!fields.is_empty()).then_some(fields);
        self
    }

    pub fn mapping(&self) -> &Mapping {
        self.mapping
    }

    pub fn derive_pk(&self, rule: &CollectionRule, record: &RawRecord) -> String {
        derive_pk(
            record,
            &rule.pk.prefer,
            self.pk_override.as_deref(),
            &self.config.pk_separator,
        )
    }

    fn parent_column(&self, rule: &CollectionRule) -> String {
        rule.parent_fk
            .clone()
            .unwrap_or_else(|| self.config.parent_fk_column.clone())
    }

    /// Keyed exactly like the parent collection's own rows.
    fn parent_link(&self, rule: &CollectionRule, parent: &RawRecord) -> ParentLink {
        let resolved = self.mapping.parent_of(rule);
        let prefer: &[String] = resolved.map(|(_, r)| r.pk.prefer.as_slice()).unwrap_or(&[]);
        ParentLink {
            column: self.parent_column(rule),
            pk: derive_pk(
                parent,
                prefer,
                self.pk_override.as_deref(),
                &self.config.pk_separator,
            ),
            collection: resolved
                .map(|(name, _)| name.to_string())
                .or_else(|| rule.parent.clone()),
        }
    }

    pub fn normalize(
        &self,
        collection: &str,
        record: &RawRecord,
        parent: Option<&RawRecord>,
    ) -> Result<NormalizedRow> {
        let rule = self.mapping.get(collection)?;
        let mut row = NormalizedRow::new(self.derive_pk(rule, record), record.canonical_json());

        let is_tree = self.mapping.format.is_tree();
        if is_tree {
            if let Some(attrs) = record.attributes() {
                for (name, value) in attrs.iter() {
                    if let Some(scalar) = value.as_scalar() {
                        row.set(format!("attr__{name}"), scalar.clone());
                    }
                }
            }
            if let Some(text) = record.text() {
                row.set(TEXT_COLUMN, text.clone());
            }
        }

        // Record fields never shadow reserved row columns.
        let parent_column = self.parent_column(rule);
        let reserved = [
            PK_COLUMN,
            RAW_JSON_COLUMN,
            PARENT_COLLECTION_COLUMN,
            parent_column.as_str(),
        ];
        for (field, value) in record.iter() {
            let slot = is_tree && (field == ATTR_SLOT || field == TEXT_SLOT);
            if slot || reserved.contains(&field) {
                continue;
            }
            route_field(&mut row, field, value);
        }

        self.add_source_columns(&mut row, rule);

        if let Some(parent) = parent {
            row.parent = Some(self.parent_link(rule, parent));
        }
        Ok(row)
    }

    fn add_source_columns(&self, row: &mut NormalizedRow, rule: &CollectionRule) {
        match (&rule.locator, self.mapping.format) {
            (Locator::Json { path }, SourceFormat::Json | SourceFormat::Jsonl) => {
                row.set(SOURCE_NAME_COLUMN, Scalar::from(self.mapping.source_name.as_str()));
                if path != "$" {
                    let dotted = path.strip_prefix("$.").unwrap_or(path);
                    row.set(JSON_RECORDS_PATH_COLUMN, Scalar::from(dotted));
                }
            }
            (Locator::Csv { .. }, _) => {
                row.set(SOURCE_NAME_COLUMN, Scalar::from(self.mapping.source_name.as_str()));
            }
            (Locator::Xlsx { sheet, .. }, _) => {
                row.set(SOURCE_NAME_COLUMN, Scalar::from(self.mapping.source_name.as_str()));
                if let Some(sheet) = sheet {
                    row.set(XLSX_SHEET_COLUMN, Scalar::from(sheet.as_str()));
                }
            }
            _ => {}
        }
    }

    pub fn raw_row(
        &self,
        collection: &str,
        record: &RawRecord,
        parent: Option<&RawRecord>,
    ) -> Result<RawRow> {
        let rule = self.mapping.get(collection)?;
        let parent_path = self
            .mapping
            .parent_of(rule)
            .map(|(_, r)| r.locator.describe());
        Ok(RawRow {
            collection: collection.to_string(),
            path: rule.locator.describe(),
            raw_json: record.canonical_json(),
            source_name: self.mapping.source_name.clone(),
            parent_raw_json: parent.map(RawRecord::canonical_json),
            parent_path: parent.and(parent_path),
        })
    }
}

fn route_field(row: &mut NormalizedRow, field: &str, value: &RawValue) {
    match value {
        RawValue::Scalar(scalar) => row.set(field, scalar.clone()),
        RawValue::Object(node) if node.is_text_node() && node.text().is_some() => {
            if let Some(text) = node.text() {
                row.set(field, text.clone());
            }
            if let Some(attrs) = node.attributes() {
                row.set(
                    format!("json__{field}__attrs"),
                    Scalar::String(attrs.to_json_string()),
                );
            }
        }
        other => row.set(format!("json__{field}"), Scalar::String(other.to_json_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PkRule;
    use serde_json::json;

    fn json_mapping(prefer: &[&str]) -> Mapping {
        let mut mapping = Mapping::new("src", SourceFormat::Json);
        mapping.collections.insert(
            "src_records".into(),
            CollectionRule::new(
                Locator::Json { path: "$".into() },
                PkRule::prefer(prefer.iter().copied()),
            ),
        );
        mapping
    }

    #[test]
    fn routes_scalars_objects_and_lists() {
        let mapping = json_mapping(&[]);
        let config = InferenceConfig::default();
        let normalizer = Normalizer::new(&mapping, &config);
        let original = json!({"a": 1, "b": {"x": 1}, "c": [1, 2]});
        let record = RawRecord::from_json(original.clone());
        let row = normalizer.normalize("src_records", &record, None).unwrap();

        assert_eq!(row.get("a"), Some(Scalar::from(1)));
        assert_eq!(row.get("json__b"), Some(Scalar::from(r#"{"x":1}"#)));
        assert_eq!(row.get("json__c"), Some(Scalar::from("[1,2]")));
        assert_eq!(row.raw_json, r#"{"a":1,"b":{"x":1},"c":[1,2]}"#);
        let back: serde_json::Value = serde_json::from_str(&row.raw_json).unwrap();
        assert_eq!(back, original);
        assert_eq!(row.pk, hashing::text_hash(&row.raw_json));
    }

    #[test]
    fn text_nodes_are_promoted() {
        let mapping = json_mapping(&[]);
        let config = InferenceConfig::default();
        let record = RawRecord::from_json(json!({"name": {"@": {"lang": "en"}, "#text": "Widget"}}));
        let row = Normalizer::new(&mapping, &config)
            .normalize("src_records", &record, None)
            .unwrap();
        assert_eq!(row.get("name"), Some(Scalar::from("Widget")));
        assert_eq!(row.get("json__name__attrs"), Some(Scalar::from(r#"{"lang":"en"}"#)));
        assert_eq!(row.get("json__name"), None);
    }

    #[test]
    fn pk_tiers() {
        let record = RawRecord::from_json(json!({"ID": " 17 ", "other": "x"}));
        let prefer = vec!["missing".to_string(), "id".to_string()];
        assert_eq!(derive_pk(&record, &prefer, None, "|"), "17");

        let fields = vec!["other".to_string(), "ID".to_string()];
        assert_eq!(
            derive_pk(&record, &prefer, Some(&fields), "|"),
            hashing::text_hash("x|17")
        );

        let absent = vec!["nope".to_string()];
        assert_eq!(
            derive_pk(&record, &absent, Some(&absent), "|"),
            hashing::content_hash(&record)
        );
        // An override with no values hashes the content even when a preference matches.
        assert_eq!(
            derive_pk(&record, &prefer, Some(&absent), "|"),
            hashing::content_hash(&record)
        );
    }

    #[test]
    fn structured_text_falls_back_to_json_column() {
        let mapping = json_mapping(&[]);
        let config = InferenceConfig::default();
        let record = RawRecord::from_json(json!({"note": {"#text": {"en": "hi"}}}));
        let row = Normalizer::new(&mapping, &config)
            .normalize("src_records", &record, None)
            .unwrap();
        assert_eq!(row.get("note"), None);
        assert_eq!(
            row.get("json__note"),
            Some(Scalar::from(r##"{"#text":{"en":"hi"}}"##))
        );
    }

    #[test]
    fn record_fields_do_not_shadow_reserved_columns() {
        let mapping = json_mapping(&["id"]);
        let config = InferenceConfig::default();
        let record = RawRecord::from_json(json!({
            "id": "k",
            "_pk": "x",
            "raw_json": "mine",
            "_parent_pk": "p"
        }));
        let row = Normalizer::new(&mapping, &config)
            .normalize("src_records", &record, None)
            .unwrap();
        let text = serde_json::to_string(&row).unwrap();
        assert_eq!(text.matches("\"_pk\"").count(), 1);
        assert_eq!(text.matches("\"raw_json\"").count(), 1);
        assert!(!text.contains("\"_parent_pk\""));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["_pk"], "k");
        assert_eq!(value["raw_json"], record.canonical_json());
    }

    #[test]
    fn tree_rows_surface_attributes_and_text() {
        let mut mapping = Mapping::new("feed", SourceFormat::Xml);
        mapping.collections.insert(
            "Items".into(),
            CollectionRule::tree("/R/Items/Item", vec!["@id".into()]),
        );
        mapping.collections.insert(
            "Prices".into(),
            CollectionRule::tree("/R/Items/Item/Prices/Price", vec![])
                .with_parent("Items", "_parent_pk"),
        );
        let config = InferenceConfig::default();
        let normalizer = Normalizer::new(&mapping, &config);

        let item = RawRecord::from_json(json!({"@": {"id": "9"}, "code": {"#text": "A"}, "#text": "t"}));
        let row = normalizer.normalize("Items", &item, None).unwrap();
        assert_eq!(row.pk, "9");
        assert_eq!(row.get("attr__id"), Some(Scalar::from("9")));
        assert_eq!(row.get("text"), Some(Scalar::from("t")));
        assert_eq!(row.get("code"), Some(Scalar::from("A")));
        assert_eq!(row.get("json__@"), None);

        let price = RawRecord::from_json(json!({"@": {"cur": "EUR"}, "#text": "1.5"}));
        let child = normalizer.normalize("Prices", &price, Some(&item)).unwrap();
        assert_eq!(child.get("_parent_pk"), Some(Scalar::from("9")));
        assert_eq!(child.get(PARENT_COLLECTION_COLUMN), Some(Scalar::from("Items")));

        let raw = normalizer.raw_row("Prices", &price, Some(&item)).unwrap();
        assert_eq!(raw.parent_path.as_deref(), Some("/R/Items/Item"));
        assert_eq!(raw.parent_raw_json, Some(item.canonical_json()));
    }

    #[test]
    fn json_rows_carry_source_columns() {
        let mut mapping = json_mapping(&["id"]);
        mapping.collections.insert(
            "src_users".into(),
            CollectionRule::json("$.users", vec!["id".into()]),
        );
        let config = InferenceConfig::default();
        let normalizer = Normalizer::new(&mapping, &config);
        let record = RawRecord::from_json(json!({"id": 3}));
        let row = normalizer.normalize("src_users", &record, None).unwrap();
        assert_eq!(row.get(SOURCE_NAME_COLUMN), Some(Scalar::from("src")));
        assert_eq!(row.get(JSON_RECORDS_PATH_COLUMN), Some(Scalar::from("users")));
        let root = normalizer.normalize("src_records", &record, None).unwrap();
        assert_eq!(root.get(JSON_RECORDS_PATH_COLUMN), None);
        assert_eq!(root.pk, "3");
    }

    #[test]
    fn serialized_row_is_flat() {
        let mapping = json_mapping(&["id"]);
        let config = InferenceConfig::default();
        let record = RawRecord::from_json(json!({"id": "k", "n": 2}));
        let row = Normalizer::new(&mapping, &config)
            .normalize("src_records", &record, None)
            .unwrap();
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["_pk"], "k");
        assert_eq!(value["n"], 2);
        assert_eq!(value["__source_name"], "src");
    }

    #[test]
    fn unknown_collection_is_rejected() {
        let mapping = json_mapping(&[]);
        let config = InferenceConfig::default();
        let record = RawRecord::new();
        assert!(Normalizer::new(&mapping, &config)
            .normalize("nope", &record, None)
            .is_err());
    }
}
