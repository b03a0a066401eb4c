//! The mapping document: named collections, how to locate their records, and
//! how to key them.
//!
//! A mapping is produced by inference, persisted as YAML, hand-edited if
//! needed, and reloaded for normalization. Collections are stored in a
//! `BTreeMap` so the serialized document is deterministic.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    sync::OnceLock,
};

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{IngestError, Result},
    hashing,
    source::SourceFormat,
    tree::TreePath,
};

pub const MAPPING_VERSION: u32 = 1;
const MAX_TABLE_NAME_LEN: usize = 120;
const FALLBACK_TABLE_NAME: &str = "table";

/// How records of a collection are located inside the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Locator {
    /// Absolute tag path: `/Root/Container`, `/Root/Container/Entity`, or a
    /// five-segment nested path.
    Tree { path: String },
    /// `$` or a dotted path such as `$.data.items`.
    Json { path: String },
    Csv {
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    Xlsx {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        use_first_sheet: bool,
    },
}

impl Locator {
    /// Path-like description used for raw audit rows.
    pub fn describe(&self) -> String {
        match self {
            Locator::Tree { path } | Locator::Json { path } => path.clone(),
            Locator::Csv { .. } => String::new(),
            Locator::Xlsx { sheet, .. } => sheet.clone().unwrap_or_default(),
        }
    }

    pub fn tree_path(&self) -> Option<&str> {
        match self {
            Locator::Tree { path } => Some(path),
            _ => None,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> u32 {
    MAPPING_VERSION
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PkRule {
    /// Candidate key fields, best first. `@name` addresses a tree attribute.
    #[serde(default)]
    pub prefer: Vec<String>,
}

impl PkRule {
    pub fn prefer<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefer: fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteDisposition {
    Append,
    Replace,
    Merge,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRule {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub locator: Locator,
    #[serde(default)]
    pub pk: PkRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fk: Option<String>,
    /// Root child that occurs exactly once.
    #[serde(default, skip_serializing_if = "is_false")]
    pub singleton: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_disposition: Option<WriteDisposition>,
}

impl CollectionRule {
    pub fn new(locator: Locator, pk: PkRule) -> Self {
        Self {
            enabled: true,
            locator,
            pk,
            parent: None,
            parent_fk: None,
            singleton: false,
            write_disposition: None,
        }
    }

    pub fn tree(path: impl Into<String>, prefer: Vec<String>) -> Self {
        Self::new(Locator::Tree { path: path.into() }, PkRule { prefer })
    }

    pub fn json(path: impl Into<String>, prefer: Vec<String>) -> Self {
        Self::new(Locator::Json { path: path.into() }, PkRule { prefer })
    }

    pub fn with_parent(mut self, parent: impl Into<String>, parent_fk: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self.parent_fk = Some(parent_fk.into());
        self
    }

    pub fn as_singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// True for five-segment tree paths.
    pub fn is_nested(&self) -> bool {
        self.locator
            .tree_path()
            .and_then(|p| TreePath::parse(p).ok())
            .is_some_and(|p| p.is_nested())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default = "default_version")]
    pub version: u32,
    pub source_name: String,
    pub format: SourceFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionRule>,
}

impl Mapping {
    pub fn new(source_name: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            version: MAPPING_VERSION,
            source_name: source_name.into(),
            format,
            root: None,
            collections: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mapping: Mapping = serde_yaml::from_reader(BufReader::new(file))?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_yaml::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Digest of the serialized mapping, used to detect rule changes between runs.
    pub fn checksum(&self) -> Result<String> {
        Ok(hashing::text_hash(&self.to_yaml_string()?))
    }

    pub fn get(&self, name: &str) -> Result<&CollectionRule> {
        self.collections
            .get(name)
            .ok_or_else(|| IngestError::UnknownCollection(name.to_string()))
    }

    /// Inserts under `name`, or under the first free `name_N` if taken.
    /// Returns the name actually used.
    pub fn insert_unique(&mut self, name: &str, rule: CollectionRule) -> String {
        let mut candidate = name.to_string();
        let mut suffix = 2;
        while self.collections.contains_key(&candidate) {
            candidate = format!("{name}_{suffix}");
            suffix += 1;
        }
        self.collections.insert(candidate.clone(), rule);
        candidate
    }

    pub fn enabled(&self) -> impl Iterator<Item = (&str, &CollectionRule)> {
        self.collections
            .iter()
            .filter(|(_, rule)| rule.enabled)
            .map(|(name, rule)| (name.as_str(), rule))
    }

    /// Parent rule of a nested collection: by name when declared, otherwise
    /// the collection whose tree path is the child's entity prefix.
    pub fn parent_of(&self, rule: &CollectionRule) -> Option<(&str, &CollectionRule)> {
        if let Some(name) = &rule.parent {
            return self
                .collections
                .get_key_value(name)
                .map(|(n, r)| (n.as_str(), r));
        }
        let child = TreePath::parse(rule.locator.tree_path()?).ok()?;
        let prefix = child.parent()?;
        self.collections.iter().find_map(|(name, candidate)| {
            let path = TreePath::parse(candidate.locator.tree_path()?).ok()?;
            (path == prefix).then_some((name.as_str(), candidate))
        })
    }

    pub fn table_name(&self, collection: &str) -> String {
        source_table_name(&self.source_name, collection)
    }

    /// Checks path shapes and parent links.
    pub fn validate(&self) -> Result<()> {
        for (name, rule) in &self.collections {
            let Some(raw) = rule.locator.tree_path() else {
                continue;
            };
            let path = TreePath::parse(raw)?;
            if let Some(parent_name) = &rule.parent {
                let parent = self.collections.get(parent_name).ok_or_else(|| {
                    IngestError::Mapping(format!(
                        "collection '{name}' names unknown parent '{parent_name}'"
                    ))
                })?;
                let Some(parent_raw) = parent.locator.tree_path() else {
                    return Err(IngestError::Mapping(format!(
                        "parent '{parent_name}' of '{name}' is not a tree collection"
                    )));
                };
                let parent_path = TreePath::parse(parent_raw)?;
                if !path.is_nested() || path.parent().as_ref() != Some(&parent_path) {
                    return Err(IngestError::ChildPathMismatch {
                        parent: parent_raw.to_string(),
                        child: raw.to_string(),
                    });
                }
            }
        }
        debug!(
            "Mapping for '{}' validated ({} collection(s))",
            self.source_name,
            self.collections.len()
        );
        Ok(())
    }
}

fn invalid_name_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_]").expect("static pattern compiles"))
}

/// Destination-safe table identifier.
pub fn sanitize_table_name(name: &str) -> String {
    let spaced = name.replace(['-', ' '], "_");
    let cleaned = invalid_name_chars().replace_all(&spaced, "");
    let mut result = cleaned.trim_matches('_').to_string();
    if result.is_empty() {
        return FALLBACK_TABLE_NAME.to_string();
    }
    if result.starts_with(|c: char| c.is_ascii_digit()) {
        result.insert_str(0, "t_");
    }
    result.truncate(MAX_TABLE_NAME_LEN);
    result
}

pub fn source_table_name(source_name: &str, collection: &str) -> String {
    sanitize_table_name(&format!("{source_name}_{collection}"))
}
