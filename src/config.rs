use std::{fs::File, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_MAX_DEPTH: usize = 6;
pub const DEFAULT_MIN_REPEATS: usize = 2;
pub const DEFAULT_PK_OBSERVE_LIMIT: usize = 3_000;
pub const DEFAULT_RANK_SAMPLE_LIMIT: usize = 500_000;
pub const DEFAULT_DISTINCT_LIMIT: usize = 2_000_000;
pub const DEFAULT_NAME_PENALTY: f64 = 0.50;
pub const DEFAULT_NULL_WEIGHT: f64 = 0.25;
pub const DEFAULT_JSON_SCAN_LIMIT: usize = 50;
pub const DEFAULT_PARENT_FK_COLUMN: &str = "_parent_pk";
pub const DEFAULT_PK_SEPARATOR: &str = "|";

const DEFAULT_PENALIZED_SUFFIXES: &[&str] = &[
    "changecode",
    "changetype",
    "status",
    "type",
    "version",
    "flag",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Deepest tag path counted during tree discovery.
    pub max_depth: usize,
    /// Occurrences needed before an entity tag counts as a collection.
    pub min_repeats: usize,
    /// Records inspected when building the provisional tree PK list.
    pub pk_observe_limit: usize,
    /// Records streamed per collection when ranking PK candidates.
    pub rank_sample_limit: usize,
    /// Cap on distinct values remembered per candidate.
    pub distinct_limit: usize,
    pub name_penalty: f64,
    pub null_weight: f64,
    /// Name suffixes that usually mark mutable, non-identifying fields.
    pub penalized_suffixes: Vec<String>,
    /// List elements checked when deciding if a JSON list holds records.
    pub json_scan_limit: usize,
    pub parent_fk_column: String,
    pub pk_separator: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            min_repeats: DEFAULT_MIN_REPEATS,
            pk_observe_limit: DEFAULT_PK_OBSERVE_LIMIT,
            rank_sample_limit: DEFAULT_RANK_SAMPLE_LIMIT,
            distinct_limit: DEFAULT_DISTINCT_LIMIT,
            name_penalty: DEFAULT_NAME_PENALTY,
            null_weight: DEFAULT_NULL_WEIGHT,
            penalized_suffixes: DEFAULT_PENALIZED_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            json_scan_limit: DEFAULT_JSON_SCAN_LIMIT,
            parent_fk_column: DEFAULT_PARENT_FK_COLUMN.to_string(),
            pk_separator: DEFAULT_PK_SEPARATOR.to_string(),
        }
    }
}

impl InferenceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let config = serde_yaml::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    pub fn with_rank_sample_limit(mut self, limit: usize) -> Self {
        self.rank_sample_limit = limit;
        self
    }

    pub fn with_distinct_limit(mut self, limit: usize) -> Self {
        self.distinct_limit = limit;
        self
    }
}
