//! Primary-key candidate ranking.
//!
//! Candidates are scored on a bounded sample of records:
//!
//! ```text
//! score = distinct / non_null  -  null_weight * (1 - non_null / total)  -  name_penalty
//! ```
//!
//! `name_penalty` applies when the name ends in a suffix that usually marks a
//! mutable attribute (`status`, `type`, `version`, ...). Candidates that never
//! carry a value score `-inf`. Ties keep their incoming order.

use std::{cmp::Ordering, collections::HashSet};

use itertools::Itertools;
use log::debug;
use regex::Regex;

use crate::{
    config::InferenceConfig,
    error::Result,
    record::{RawRecord, RawValue},
};

/// Key-like names tried against headers and object keys, in priority order.
pub const BASE_KEY_NAMES: &[&str] = &["id", "ID", "code", "Code", "key", "Key", "pk", "PK"];

/// Base names present in `names`: exact match first, then case-insensitive.
/// The result uses the spelling found in `names` and holds no duplicates.
pub fn prefer_from_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
    BASE_KEY_NAMES
        .iter()
        .filter_map(|base| {
            names
                .iter()
                .find(|name| **name == *base)
                .or_else(|| names.iter().find(|name| name.eq_ignore_ascii_case(base)))
                .map(|name| name.to_string())
        })
        .unique()
        .collect()
}

pub fn base_prefer() -> Vec<String> {
    BASE_KEY_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Key value of `field` in `record`, trimmed, `None` when absent or blank.
///
/// `@name` reads an attribute; plain names read a scalar field or the text of
/// a text-only child. Lookups fall back to case-insensitive matching.
pub fn candidate_value(record: &RawRecord, field: &str) -> Option<String> {
    if let Some(attr) = field.strip_prefix('@').filter(|a| !a.is_empty()) {
        let from_attr = record.attributes().and_then(|attrs| {
            attrs
                .get_ci(attr)
                .and_then(RawValue::as_scalar)
                .and_then(|s| s.as_key_string())
        });
        if from_attr.is_some() {
            return from_attr;
        }
    }
    match record.get_ci(field)? {
        RawValue::Scalar(scalar) => scalar.as_key_string(),
        RawValue::Object(node) if node.is_text_node() => node.text()?.as_key_string(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub field: String,
    pub non_null: usize,
    pub distinct: usize,
    pub score: f64,
}

#[derive(Debug, Default)]
struct CandidateStats {
    non_null: usize,
    distinct: HashSet<String>,
    saturated: bool,
}

pub struct PkRanker<'a> {
    config: &'a InferenceConfig,
    penalty: Option<Regex>,
    candidates: Vec<String>,
    stats: Vec<CandidateStats>,
    total: usize,
}

impl<'a> PkRanker<'a> {
    pub fn new(candidates: Vec<String>, config: &'a InferenceConfig) -> Result<Self> {
        let penalty = if config.penalized_suffixes.is_empty() {
            None
        } else {
            let alternatives = config
                .penalized_suffixes
                .iter()
                .map(|s| regex::escape(s))
                .join("|");
            Some(Regex::new(&format!("(?i)(?:{alternatives})$"))?)
        };
        let stats = candidates.iter().map(|_| CandidateStats::default()).collect();
        Ok(Self {
            config,
            penalty,
            candidates,
            stats,
            total: 0,
        })
    }

    pub fn is_full(&self) -> bool {
        self.total >= self.config.rank_sample_limit
    }

    pub fn observed(&self) -> usize {
        self.total
    }

    /// Records one sample. Returns `false` once the sample cap is reached.
    pub fn observe(&mut self, record: &RawRecord) -> bool {
        if self.is_full() {
            return false;
        }
        self.total += 1;
        let limit = self.config.distinct_limit;
        for (field, stats) in self.candidates.iter().zip(self.stats.iter_mut()) {
            let Some(value) = candidate_value(record, field) else {
                continue;
            };
            stats.non_null += 1;
            if stats.distinct.len() < limit {
                stats.distinct.insert(value);
            } else if !stats.saturated && !stats.distinct.contains(&value) {
                stats.saturated = true;
                debug!("Distinct cap reached for PK candidate '{field}'");
            }
        }
        !self.is_full()
    }

    fn is_penalized(&self, field: &str) -> bool {
        self.penalty.as_ref().is_some_and(|re| re.is_match(field))
    }

    pub fn scores(&self) -> Vec<CandidateScore> {
        self.candidates
            .iter()
            .zip(&self.stats)
            .map(|(field, stats)| {
                let score = if stats.non_null == 0 || self.total == 0 {
                    f64::NEG_INFINITY
                } else {
                    let non_null = stats.non_null as f64;
                    let distinct_rate = stats.distinct.len() as f64 / non_null;
                    let null_ratio = 1.0 - non_null / self.total as f64;
                    let penalty = if self.is_penalized(field) {
                        self.config.name_penalty
                    } else {
                        0.0
                    };
                    distinct_rate - self.config.null_weight * null_ratio - penalty
                };
                CandidateScore {
                    field: field.clone(),
                    non_null: stats.non_null,
                    distinct: stats.distinct.len(),
                    score,
                }
            })
            .collect()
    }

    /// Candidates ordered best first; stable for equal scores.
    pub fn rank(&self) -> Vec<String> {
        let mut scored = self.scores();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        for entry in &scored {
            debug!(
                "PK candidate '{}': score={:.3} non_null={} distinct={}",
                entry.field, entry.score, entry.non_null, entry.distinct
            );
        }
        scored.into_iter().map(|entry| entry.field).collect()
    }
}

/// Reorders `prefer` by observed uniqueness over up to `rank_sample_limit`
/// records. An empty candidate list is returned unchanged without reading.
pub fn rank_candidates<I>(
    prefer: &[String],
    records: I,
    config: &InferenceConfig,
) -> Result<Vec<String>>
where
    I: IntoIterator<Item = Result<RawRecord>>,
{
    if prefer.is_empty() {
        return Ok(Vec::new());
    }
    let mut ranker = PkRanker::new(prefer.to_vec(), config)?;
    for record in records {
        if !ranker.observe(&record?) {
            break;
        }
    }
    Ok(ranker.rank())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn records(values: Vec<serde_json::Value>) -> Vec<Result<RawRecord>> {
        values.into_iter().map(|v| Ok(RawRecord::from_json(v))).collect()
    }

    #[test]
    fn header_matching_prefers_exact_then_case_insensitive() {
        let header = ["ID", "Name", "code"];
        assert_eq!(prefer_from_names(&header), vec!["ID", "code"]);
        let none: [&str; 2] = ["Name", "Amount"];
        assert!(prefer_from_names(&none).is_empty());
    }

    #[test]
    fn unique_code_beats_low_cardinality_status() {
        let config = InferenceConfig::default();
        let data = records(
            (0..10)
                .map(|i| {
                    let status = if i % 2 == 0 { "A" } else { "B" };
                    json!({"status": status, "code": format!("C{i}")})
                })
                .collect(),
        );
        let ranked =
            rank_candidates(&names(&["status", "code"]), data, &config).expect("rank");
        assert_eq!(ranked, vec!["code", "status"]);
    }

    #[test]
    fn penalty_applies_to_suffix_case_insensitively() {
        let config = InferenceConfig::default();
        let data = records(
            (0..4)
                .map(|i| json!({"RecordStatus": format!("S{i}"), "ref": format!("R{i}")}))
                .collect(),
        );
        let ranker = {
            let mut r = PkRanker::new(names(&["RecordStatus", "ref"]), &config).unwrap();
            for rec in data {
                r.observe(&rec.unwrap());
            }
            r
        };
        let scores = ranker.scores();
        assert_eq!(scores[0].score, 0.5);
        assert_eq!(scores[1].score, 1.0);
        assert_eq!(ranker.rank(), vec!["ref", "RecordStatus"]);
    }

    #[test]
    fn sparse_candidates_lose_to_complete_ones() {
        let config = InferenceConfig::default();
        let data = records(vec![
            json!({"a": "1", "b": "1"}),
            json!({"a": "2"}),
            json!({"a": "3"}),
            json!({"a": "4", "b": "2"}),
        ]);
        let ranked = rank_candidates(&names(&["b", "a"]), data, &config).unwrap();
        assert_eq!(ranked, vec!["a", "b"]);
    }

    #[test]
    fn ties_and_missing_fields_keep_input_order() {
        let config = InferenceConfig::default();
        let data = records(vec![json!({"x": "1", "y": "1"}), json!({"x": "2", "y": "2"})]);
        let ranked =
            rank_candidates(&names(&["missing", "y", "x"]), data, &config).unwrap();
        assert_eq!(ranked, vec!["y", "x", "missing"]);
    }

    #[test]
    fn sample_cap_stops_reading() {
        let config = InferenceConfig::default().with_rank_sample_limit(2);
        let mut ranker = PkRanker::new(names(&["id"]), &config).unwrap();
        let rec = RawRecord::from_json(json!({"id": "1"}));
        assert!(ranker.observe(&rec));
        assert!(!ranker.observe(&rec));
        assert!(!ranker.observe(&rec));
        assert_eq!(ranker.observed(), 2);
    }

    #[test]
    fn attribute_candidates_read_attribute_slot() {
        let record = RawRecord::from_json(json!({"@": {"id": " 42 "}, "name": {"#text": "n"}}));
        assert_eq!(candidate_value(&record, "@id").as_deref(), Some("42"));
        assert_eq!(candidate_value(&record, "name").as_deref(), Some("n"));
        assert_eq!(candidate_value(&record, "@missing"), None);
    }
}
