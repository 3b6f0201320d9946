//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::PersistenceStrategy;

mod cli;

pub use cli::{CliArgs, Command, DigestArgs, FetchArgs, LoggingOverrides, SizeArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "stratacache";
const ENV_PREFIX: &str = "STRATACACHE";
const DEFAULT_MEMORY_CACHE_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_DISK_CACHE_BYTES: u64 = 250 * 1024 * 1024;
const DEFAULT_KEY_ENCODING_CAPACITY: usize = 1000;
const DEFAULT_DEFERRED_POOL_CAPACITY: usize = 20;

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_memory_cache: bool,
    pub memory_cache_bytes: usize,
    pub disk_cache_bytes: u64,
    pub disk_cache_dir: Option<PathBuf>,
    pub key_encoding_capacity: usize,
    pub deferred_pool_capacity: usize,
    pub default_strategy: PersistenceStrategy,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_logging_overrides(&cli.logging);
    match &cli.command {
        Command::Fetch(args) => raw.apply_fetch_overrides(args),
        Command::Digest(_) => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enable_memory_cache: Option<bool>,
    memory_cache_bytes: Option<usize>,
    disk_cache_bytes: Option<u64>,
    disk_cache_dir: Option<PathBuf>,
    key_encoding_capacity: Option<usize>,
    deferred_pool_capacity: Option<usize>,
    default_strategy: Option<String>,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_fetch_overrides(&mut self, args: &FetchArgs) {
        if let Some(dir) = args.cache_dir.as_ref() {
            self.cache.disk_cache_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let key_encoding_capacity = non_zero(
        cache
            .key_encoding_capacity
            .unwrap_or(DEFAULT_KEY_ENCODING_CAPACITY),
        "cache.key_encoding_capacity",
    )?;

    let disk_cache_bytes = cache.disk_cache_bytes.unwrap_or(DEFAULT_DISK_CACHE_BYTES);
    if disk_cache_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.disk_cache_bytes",
            "must be greater than zero",
        ));
    }

    let disk_cache_dir = cache
        .disk_cache_dir
        .filter(|dir| !dir.as_os_str().is_empty());

    let default_strategy = match cache.default_strategy {
        Some(value) => PersistenceStrategy::from_str(&value)
            .map_err(|reason| LoadError::invalid("cache.default_strategy", reason))?,
        None => PersistenceStrategy::default(),
    };

    Ok(CacheSettings {
        enable_memory_cache: cache.enable_memory_cache.unwrap_or(true),
        memory_cache_bytes: cache
            .memory_cache_bytes
            .unwrap_or(DEFAULT_MEMORY_CACHE_BYTES),
        disk_cache_bytes,
        disk_cache_dir,
        key_encoding_capacity,
        deferred_pool_capacity: cache
            .deferred_pool_capacity
            .unwrap_or(DEFAULT_DEFERRED_POOL_CAPACITY),
        default_strategy,
    })
}

fn non_zero(value: usize, key: &'static str) -> Result<usize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
