pub mod change;
pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod hashing;
pub mod io_utils;
pub mod json_shape;
pub mod mapping;
pub mod normalize;
pub mod pk_rank;
pub mod record;
pub mod source;
pub mod tabular;
pub mod tree;

use std::{env, path::Path, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    change::JsonlMetadataStore,
    cli::{CheckArgs, Cli, Commands, InferArgs, NormalizeArgs, SourceArgs},
    config::InferenceConfig,
    context::RunContext,
    engine::RemoteValidator,
    mapping::Mapping,
    normalize::Normalizer,
    source::{FileSource, PreparedInput, SourceOptions},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("ingest_shape", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Infer(args) => handle_infer(&args),
        Commands::Normalize(args) => handle_normalize(&args),
        Commands::Check(args) => handle_check(&args),
    }
}

fn prepare(args: &SourceArgs, declared_format: Option<&str>) -> Result<(PreparedInput, SourceOptions)> {
    let format = args.format.as_deref().or(declared_format);
    let input = PreparedInput::local(&args.input, format, args.name.as_deref())
        .with_context(|| format!("Resolving source {:?}", args.input))?;
    let options = SourceOptions {
        records_path: args.records_path.clone(),
        sheet: args.sheet.clone(),
        use_first_sheet: args.use_first_sheet,
        delimiter: args.delimiter,
        encoding: args.input_encoding.clone(),
        table: args.table.clone(),
    };
    debug!("Prepared {:?} as {} ({})", input.path, input.source_name, input.format);
    Ok((input, options))
}

fn load_config(path: Option<&Path>) -> Result<InferenceConfig> {
    match path {
        Some(path) => InferenceConfig::load(path)
            .with_context(|| format!("Loading inference config from {path:?}")),
        None => Ok(InferenceConfig::default()),
    }
}

fn load_mapping(path: &Path) -> Result<Mapping> {
    Mapping::load(path).with_context(|| format!("Loading mapping from {path:?}"))
}

fn handle_infer(args: &InferArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let (input, options) = prepare(&args.source, None)?;
    let ctx = RunContext::new(&input.source_name, "default");
    let mapping = engine::infer_mapping(&input, &options, &config, &ctx)
        .with_context(|| format!("Inferring mapping for {:?}", input.path))?;
    match &args.output {
        Some(path) => {
            mapping
                .save(path)
                .with_context(|| format!("Writing mapping to {path:?}"))?;
            info!(
                "Mapping with {} collection(s) written to {:?}",
                mapping.collections.len(),
                path
            );
        }
        None => print!("{}", mapping.to_yaml_string()?),
    }
    Ok(())
}

fn handle_normalize(args: &NormalizeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let loaded = args.mapping.as_deref().map(load_mapping).transpose()?;
    let declared = loaded.as_ref().map(|m| m.format.as_str());
    let (input, options) = prepare(&args.source, declared)?;
    let ctx = RunContext::new(&input.source_name, "default");
    let mapping = match loaded {
        Some(mapping) => mapping,
        None => engine::infer_mapping(&input, &options, &config, &ctx)
            .with_context(|| format!("Inferring mapping for {:?}", input.path))?,
    };
    let source = FileSource::new(input, options);
    let normalizer = Normalizer::new(&mapping, &config).with_pk_override(
        args.pk_fields
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect(),
    );
    let summary = engine::export_jsonl(&source, &normalizer, &args.output_dir, !args.no_raw)
        .with_context(|| format!("Writing rows to {:?}", args.output_dir))?;
    let total: usize = summary.tables.iter().map(|(_, rows)| rows).sum();
    info!(
        "[{}] Normalized {total} row(s) into {} table(s) (run {})",
        ctx.source_name,
        summary.tables.len(),
        ctx.run_id
    );
    Ok(())
}

fn handle_check(args: &CheckArgs) -> Result<()> {
    let mapping = args.mapping.as_deref().map(load_mapping).transpose()?;
    let mapping_checksum = mapping.as_ref().map(Mapping::checksum).transpose()?;
    let declared = mapping.as_ref().map(|m| m.format.as_str());
    let (input, _) = prepare(&args.source, declared)?;
    let ctx = RunContext::new(&input.source_name, &args.dataset);
    let mut store = JsonlMetadataStore::new(&args.store);
    let remote = RemoteValidator {
        url: args.url.clone(),
        etag: args.etag.clone(),
        content_length: args.content_length,
    };
    let outcome = engine::check_for_changes(
        &input,
        &remote,
        mapping_checksum.as_deref(),
        &store,
        args.force,
        &ctx,
    )
    .with_context(|| format!("Checking {:?} for changes", input.path))?;

    if !outcome.should_process() {
        println!("skip");
        return Ok(());
    }
    println!("process");
    if args.record {
        let row = engine::record_run(&mut store, &ctx, outcome.observation)
            .with_context(|| format!("Appending metadata to {:?}", args.store))?;
        debug!("Recorded run {:?} for {}", row.last_run_id, row.source_name);
    }
    Ok(())
}
