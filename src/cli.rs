use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Infer mappings and normalize records from XML, JSON, CSV and XLSX sources",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Discover collections and PK candidates and write a mapping document
    Infer(InferArgs),
    /// Stream records through a mapping into JSON-lines tables
    Normalize(NormalizeArgs),
    /// Decide whether a source changed since its last recorded run
    Check(CheckArgs),
}

/// Options describing how to read one local source.
#[derive(Debug, Args, Clone)]
pub struct SourceArgs {
    /// Input file (xml, json, jsonl, csv, xlsx)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Source format; guessed from the extension when omitted or `auto`
    #[arg(long)]
    pub format: Option<String>,
    /// Short source name (defaults to the file stem)
    #[arg(long)]
    pub name: Option<String>,
    /// Dotted path to the record list inside a JSON document
    #[arg(long = "records-path")]
    pub records_path: Option<String>,
    /// Worksheet to read from an XLSX workbook
    #[arg(long)]
    pub sheet: Option<String>,
    /// Read the first worksheet when no sheet is named
    #[arg(long = "use-first-sheet")]
    pub use_first_sheet: bool,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of a CSV input (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Logical table name for CSV collections
    #[arg(long)]
    pub table: Option<String>,
}

#[derive(Debug, Args)]
pub struct InferArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// YAML file overriding inference heuristics
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Destination mapping file (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct NormalizeArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Mapping document; inferred on the fly when omitted
    #[arg(short, long)]
    pub mapping: Option<PathBuf>,
    /// YAML file overriding inference heuristics
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Output directory for `<table>.jsonl` files
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: PathBuf,
    /// Comma-separated fields whose values key every row
    #[arg(long = "pk-fields", value_delimiter = ',')]
    pub pk_fields: Vec<String>,
    /// Skip the raw audit stream
    #[arg(long = "no-raw")]
    pub no_raw: bool,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Mapping document whose checksum takes part in the comparison
    #[arg(short, long)]
    pub mapping: Option<PathBuf>,
    /// JSON-lines metadata store
    #[arg(long)]
    pub store: PathBuf,
    /// Dataset the source is loaded into
    #[arg(long, default_value = "default")]
    pub dataset: String,
    /// Always report the source as changed
    #[arg(long)]
    pub force: bool,
    /// Append this run's metadata row when the source is processed
    #[arg(long)]
    pub record: bool,
    /// Address the source was fetched from
    #[arg(long)]
    pub url: Option<String>,
    /// Cache validator reported by the server
    #[arg(long)]
    pub etag: Option<String>,
    /// Content length reported by the server
    #[arg(long = "content-length")]
    pub content_length: Option<u64>,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
