//! Two-checkpoint change detection against an append-only metadata store.
//!
//! - **Preliminary**: before the full source is read, compare a cheap checksum
//!   (cache validator or local file hash) plus the mapping checksum.
//! - **Exact**: after the source is materialized, compare the content checksum
//!   plus the mapping checksum.
//!
//! A checkpoint skips only when both stored values match. `force` disables
//! skipping. A missing checksum or a failing store never causes a skip.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    context::RunContext,
    error::{IngestError, Result},
    hashing::short,
    source::SourceFormat,
};

/// One row per processed source per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub source_name: String,
    pub source_url: Option<String>,
    pub source_type: Option<String>,
    pub first_ingest_timestamp: DateTime<Utc>,
    pub last_ingest_timestamp: DateTime<Utc>,
    pub last_source_checksum: Option<String>,
    pub last_preliminary_checksum: Option<String>,
    pub last_mapping_checksum: Option<String>,
    pub last_source_size_bytes: Option<u64>,
    pub format: Option<SourceFormat>,
    pub last_run_id: Option<String>,
    pub dataset: String,
}

/// What a run observed about its source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunObservation {
    pub source_url: Option<String>,
    pub source_type: Option<String>,
    pub format: Option<SourceFormat>,
    pub preliminary_checksum: Option<String>,
    pub exact_checksum: Option<String>,
    pub mapping_checksum: Option<String>,
    pub size_bytes: Option<u64>,
}

impl SourceMetadata {
    /// Row for this run. The first-ingest time carries over from `previous`;
    /// the run id is recorded only on first ingestion or when content changed.
    pub fn for_run(
        previous: Option<&SourceMetadata>,
        ctx: &RunContext,
        observed: RunObservation,
        now: DateTime<Utc>,
    ) -> Self {
        let content_changed = match previous {
            None => true,
            Some(prev) => prev.last_source_checksum != observed.exact_checksum,
        };
        let last_run_id = if content_changed {
            Some(ctx.run_id.clone())
        } else {
            previous.and_then(|p| p.last_run_id.clone())
        };
        Self {
            source_name: ctx.source_name.clone(),
            source_url: observed.source_url,
            source_type: observed.source_type,
            first_ingest_timestamp: previous.map(|p| p.first_ingest_timestamp).unwrap_or(now),
            last_ingest_timestamp: now,
            last_source_checksum: observed.exact_checksum,
            last_preliminary_checksum: observed.preliminary_checksum,
            last_mapping_checksum: observed.mapping_checksum,
            last_source_size_bytes: observed.size_bytes,
            format: observed.format,
            last_run_id,
            dataset: ctx.dataset.clone(),
        }
    }
}

/// Latest non-null checksum per field for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredChecksums {
    pub preliminary: Option<String>,
    pub exact: Option<String>,
    pub mapping: Option<String>,
}

pub trait MetadataStore {
    /// All rows for a source and dataset, oldest first.
    fn history(&self, source_name: &str, dataset: &str) -> Result<Vec<SourceMetadata>>;

    fn append(&mut self, rows: &[SourceMetadata]) -> Result<()>;

    fn latest(&self, source_name: &str, dataset: &str) -> Result<Option<SourceMetadata>> {
        let mut rows = self.history(source_name, dataset)?;
        rows.sort_by_key(|row| row.last_ingest_timestamp);
        Ok(rows.pop())
    }

    fn latest_checksums(&self, source_name: &str, dataset: &str) -> Result<Option<StoredChecksums>> {
        let mut rows = self.history(source_name, dataset)?;
        if rows.is_empty() {
            return Ok(None);
        }
        rows.sort_by_key(|row| std::cmp::Reverse(row.last_ingest_timestamp));
        Ok(Some(StoredChecksums {
            preliminary: rows
                .iter()
                .find_map(|r| r.last_preliminary_checksum.clone()),
            exact: rows.iter().find_map(|r| r.last_source_checksum.clone()),
            mapping: rows.iter().find_map(|r| r.last_mapping_checksum.clone()),
        }))
    }
}

/// Append-only JSON-lines file; a missing file is an empty store.
#[derive(Debug, Clone)]
pub struct JsonlMetadataStore {
    path: PathBuf,
}

impl JsonlMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetadataStore for JsonlMetadataStore {
    fn history(&self, source_name: &str, dataset: &str) -> Result<Vec<SourceMetadata>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut rows = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: SourceMetadata = serde_json::from_str(&line).map_err(|err| {
                IngestError::Metadata(format!(
                    "{}:{}: {err}",
                    self.path.display(),
                    index + 1
                ))
            })?;
            if row.source_name == source_name && row.dataset == dataset {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn append(&mut self, rows: &[SourceMetadata]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for row in rows {
            serde_json::to_writer(&mut file, row)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }
}

/// In-process store for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataStore {
    rows: Vec<SourceMetadata>,
}

impl MetadataStore for MemoryMetadataStore {
    fn history(&self, source_name: &str, dataset: &str) -> Result<Vec<SourceMetadata>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.source_name == source_name && r.dataset == dataset)
            .cloned()
            .collect())
    }

    fn append(&mut self, rows: &[SourceMetadata]) -> Result<()> {
        self.rows.extend_from_slice(rows);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Preliminary,
    Exact,
}

impl Checkpoint {
    fn label(&self) -> &'static str {
        match self {
            Checkpoint::Preliminary => "preliminary",
            Checkpoint::Exact => "exact",
        }
    }

    fn stored<'a>(&self, stored: &'a StoredChecksums) -> Option<&'a str> {
        match self {
            Checkpoint::Preliminary => stored.preliminary.as_deref(),
            Checkpoint::Exact => stored.exact.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessReason {
    Forced,
    NoChecksum,
    NoHistory,
    ChecksumChanged,
    MappingChanged,
    StoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Process(ProcessReason),
}

impl Decision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Decision::Skip)
    }
}

pub struct ChangeDetector<'a> {
    store: &'a dyn MetadataStore,
    force: bool,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(store: &'a dyn MetadataStore, force: bool) -> Self {
        Self { store, force }
    }

    pub fn check(
        &self,
        ctx: &RunContext,
        checkpoint: Checkpoint,
        checksum: Option<&str>,
        mapping_checksum: Option<&str>,
    ) -> Decision {
        let label = checkpoint.label();
        if self.force {
            info!("[{}] {label} check: forced reprocess", ctx.source_name);
            return Decision::Process(ProcessReason::Forced);
        }
        let Some(checksum) = checksum else {
            info!("[{}] {label} check: no checksum, processing", ctx.source_name);
            return Decision::Process(ProcessReason::NoChecksum);
        };
        let stored = match self.store.latest_checksums(&ctx.source_name, &ctx.dataset) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                info!("[{}] {label} check: first ingestion", ctx.source_name);
                return Decision::Process(ProcessReason::NoHistory);
            }
            Err(err) => {
                warn!(
                    "[{}] {label} check: metadata lookup failed, assuming changed: {err}",
                    ctx.source_name
                );
                return Decision::Process(ProcessReason::StoreUnavailable);
            }
        };
        let previous = checkpoint.stored(&stored);
        info!(
            "[{}] {label} check: stored={} new={} mapping stored={} new={}",
            ctx.source_name,
            short(previous),
            short(Some(checksum)),
            short(stored.mapping.as_deref()),
            short(mapping_checksum)
        );
        if previous != Some(checksum) {
            return Decision::Process(ProcessReason::ChecksumChanged);
        }
        match (stored.mapping.as_deref(), mapping_checksum) {
            (Some(old), Some(new)) if old == new => {
                info!("[{}] {label} check: unchanged, skipping", ctx.source_name);
                Decision::Skip
            }
            _ => Decision::Process(ProcessReason::MappingChanged),
        }
    }
}
