use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::cache::PersistenceStrategy;

/// Command-line arguments for the stratacache binary.
#[derive(Debug, Parser)]
#[command(
    name = "stratacache",
    version,
    about = "Deduplicating multi-tier artifact cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "STRATACACHE_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the persistent cache names a request would use.
    Digest(DigestArgs),
    /// Load a local file through every cache tier.
    Fetch(FetchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct DigestArgs {
    /// Model URI the request is for.
    #[arg(long, value_name = "URI")]
    pub model: String,

    #[command(flatten)]
    pub size: SizeArgs,

    /// Caller-supplied version signature.
    #[arg(long, value_name = "SIGNATURE")]
    pub signature: Option<String>,

    /// Id of the transformation applied to the artifact.
    #[arg(long, value_name = "ID")]
    pub transformation: Option<String>,

    /// Artifact type of the output (any|bytes|text|file|image|animated-image).
    #[arg(long, value_name = "TYPE", default_value = "bytes")]
    pub output: String,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    /// File to load.
    #[arg(value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub path: PathBuf,

    #[command(flatten)]
    pub size: SizeArgs,

    /// Persistence strategy (all|none|source-only|artifact-only|automatic).
    #[arg(long, value_name = "STRATEGY")]
    pub strategy: Option<PersistenceStrategy>,

    /// Override the directory of the on-disk tiers.
    #[arg(long = "cache-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_dir: Option<PathBuf>,

    /// Load the file this many times, reporting where each load was served from.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,
}

#[derive(Debug, Args, Default, Clone, Copy)]
pub struct SizeArgs {
    /// Requested width; omitted means the original size.
    #[arg(long, value_name = "PIXELS")]
    pub width: Option<i32>,

    /// Requested height; omitted means the original size.
    #[arg(long, value_name = "PIXELS")]
    pub height: Option<i32>,
}
