//! Per-source orchestration: inference, row streams and change checks.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use log::{debug, info};

use crate::{
    change::{ChangeDetector, Checkpoint, Decision, MetadataStore, RunObservation, SourceMetadata},
    config::InferenceConfig,
    context::RunContext,
    error::Result,
    hashing::{cache_validator_checksum, file_checksum},
    io_utils::{self, JsonLinesWriter},
    json_shape,
    mapping::Mapping,
    normalize::{NormalizedRow, Normalizer, RawRow},
    pk_rank::rank_candidates,
    source::{FileSource, PreparedInput, RecordSource, SourceFormat, SourceOptions},
    tabular, tree,
};

pub const RAW_STREAM_FILE: &str = "raw_ingest.jsonl";

/// Infers the mapping for one local source and ranks its PK candidates.
pub fn infer_mapping(
    input: &PreparedInput,
    options: &SourceOptions,
    config: &InferenceConfig,
    ctx: &RunContext,
) -> Result<Mapping> {
    let name = input.source_name.as_str();
    info!(
        "[{name}] Inferring {} mapping from {:?} (run {})",
        input.format,
        input.path,
        ctx.run_id
    );
    let mut mapping = match input.format {
        SourceFormat::Xml => tree::infer_tree_mapping(&input.path, name, config)?,
        SourceFormat::Json => {
            json_shape::infer_json_mapping(&input.path, name, options.records_path.as_deref(), config)?
        }
        SourceFormat::Jsonl => json_shape::infer_jsonl_mapping(name),
        SourceFormat::Csv => {
            let delimiter = io_utils::resolve_input_delimiter(&input.path, options.delimiter);
            let encoding = io_utils::resolve_encoding(options.encoding.as_deref())?;
            tabular::infer_csv_mapping(
                &input.path,
                name,
                options.table.as_deref(),
                delimiter,
                encoding,
            )?
        }
        SourceFormat::Xlsx => tabular::infer_xlsx_mapping(
            &input.path,
            name,
            options.sheet.as_deref(),
            options.use_first_sheet,
        )?,
    };
    mapping.validate()?;

    let source = FileSource::new(input.clone(), options.clone());
    refine_pk_preferences(&mut mapping, &source, config)?;
    info!(
        "[{name}] Mapping ready: {} collection(s)",
        mapping.collections.len()
    );
    Ok(mapping)
}

/// Reorders each tree or JSON collection's PK list by sampled uniqueness.
/// Tabular collections keep their header order.
pub fn refine_pk_preferences(
    mapping: &mut Mapping,
    source: &dyn RecordSource,
    config: &InferenceConfig,
) -> Result<()> {
    if mapping.format.is_tabular() {
        return Ok(());
    }
    let names: Vec<String> = mapping.collections.keys().cloned().collect();
    for name in names {
        let rule = mapping.get(&name)?.clone();
        if rule.pk.prefer.len() < 2 {
            continue;
        }
        let records = source.open(&rule)?.map(|item| item.map(|r| r.record));
        let ranked = rank_candidates(&rule.pk.prefer, records, config)?;
        debug!("[{}] Ranked PK list for '{name}': {ranked:?}", source.source_name());
        if let Some(rule) = mapping.collections.get_mut(&name) {
            rule.pk.prefer = ranked;
        }
    }
    Ok(())
}

/// Lazy normalized rows of one collection.
pub fn normalized_rows<'a>(
    source: &'a dyn RecordSource,
    normalizer: &'a Normalizer<'a>,
    collection: &'a str,
) -> Result<impl Iterator<Item = Result<NormalizedRow>> + 'a> {
    let rule = normalizer.mapping().get(collection)?;
    let stream = source.open(rule)?;
    Ok(stream.map(move |item| {
        let item = item?;
        normalizer.normalize(collection, &item.record, item.parent.as_deref())
    }))
}

/// One raw audit stream over every enabled collection, opened in turn.
pub fn raw_rows<'a>(
    source: &'a dyn RecordSource,
    normalizer: &'a Normalizer<'a>,
) -> Box<dyn Iterator<Item = Result<RawRow>> + 'a> {
    let names: Vec<&'a str> = normalizer.mapping().enabled().map(|(name, _)| name).collect();
    Box::new(names.into_iter().flat_map(
        move |name| -> Box<dyn Iterator<Item = Result<RawRow>> + 'a> {
            let opened = normalizer
                .mapping()
                .get(name)
                .and_then(|rule| source.open(rule));
            match opened {
                Ok(stream) => Box::new(stream.map(move |item| {
                    let item = item?;
                    normalizer.raw_row(name, &item.record, item.parent.as_deref())
                })),
                Err(err) => Box::new(std::iter::once(Err(err))),
            }
        },
    ))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    /// (table file, rows written) per enabled collection.
    pub tables: Vec<(PathBuf, usize)>,
    pub raw_rows: Option<usize>,
}

/// Writes `<table>.jsonl` per enabled collection, plus the raw stream.
pub fn export_jsonl(
    source: &dyn RecordSource,
    normalizer: &Normalizer<'_>,
    out_dir: &Path,
    include_raw: bool,
) -> Result<ExportSummary> {
    fs::create_dir_all(out_dir)?;
    let mapping = normalizer.mapping();
    let mut summary = ExportSummary::default();
    for (name, _) in mapping.enabled() {
        let target = out_dir.join(format!("{}.jsonl", mapping.table_name(name)));
        let mut writer = JsonLinesWriter::create(Some(target.as_path()))?;
        for row in normalized_rows(source, normalizer, name)? {
            writer.write(&row?)?;
        }
        let written = writer.finish()?;
        info!(
            "[{}] {name}: {written} row(s) -> {target:?}",
            mapping.source_name
        );
        summary.tables.push((target, written));
    }
    if include_raw {
        let raw_target = out_dir.join(RAW_STREAM_FILE);
        let mut writer = JsonLinesWriter::create(Some(raw_target.as_path()))?;
        for row in raw_rows(source, normalizer) {
            writer.write(&row?)?;
        }
        summary.raw_rows = Some(writer.finish()?);
    }
    Ok(summary)
}

/// What a remote server reported about the source before download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteValidator {
    pub url: Option<String>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeCheck {
    pub preliminary: Decision,
    /// `None` when the preliminary checkpoint already skipped.
    pub exact: Option<Decision>,
    pub observation: RunObservation,
}

impl ChangeCheck {
    pub fn should_process(&self) -> bool {
        !self.preliminary.is_skip() && !self.exact.is_some_and(|d| d.is_skip())
    }
}

/// Runs both checkpoints for a local source. Without a remote validator the
/// preliminary checksum is the local file hash.
pub fn check_for_changes(
    input: &PreparedInput,
    remote: &RemoteValidator,
    mapping_checksum: Option<&str>,
    store: &dyn MetadataStore,
    force: bool,
    ctx: &RunContext,
) -> Result<ChangeCheck> {
    let detector = ChangeDetector::new(store, force);
    let local_checksum = file_checksum(&input.path)?;
    let preliminary_checksum = match remote.url.as_deref() {
        Some(url) => {
            cache_validator_checksum(url, remote.etag.as_deref(), remote.content_length)
        }
        None => Some(local_checksum.clone()),
    };
    let mut observation = RunObservation {
        source_url: remote.url.clone(),
        source_type: Some(if remote.url.is_some() { "url" } else { "file" }.to_string()),
        format: Some(input.format),
        preliminary_checksum,
        exact_checksum: None,
        mapping_checksum: mapping_checksum.map(str::to_string),
        size_bytes: io_utils::file_size(&input.path).or(remote.content_length),
    };

    let preliminary = detector.check(
        ctx,
        Checkpoint::Preliminary,
        observation.preliminary_checksum.as_deref(),
        mapping_checksum,
    );
    if preliminary.is_skip() {
        return Ok(ChangeCheck {
            preliminary,
            exact: None,
            observation,
        });
    }
    observation.exact_checksum = Some(local_checksum);
    let exact = detector.check(
        ctx,
        Checkpoint::Exact,
        observation.exact_checksum.as_deref(),
        mapping_checksum,
    );
    Ok(ChangeCheck {
        preliminary,
        exact: Some(exact),
        observation,
    })
}

/// Appends this run's metadata row and returns it.
pub fn record_run(
    store: &mut dyn MetadataStore,
    ctx: &RunContext,
    observation: RunObservation,
) -> Result<SourceMetadata> {
    let previous = store.latest(&ctx.source_name, &ctx.dataset)?;
    let row = SourceMetadata::for_run(previous.as_ref(), ctx, observation, Utc::now());
    store.append(std::slice::from_ref(&row))?;
    Ok(row)
}
