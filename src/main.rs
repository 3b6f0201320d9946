use std::{path::Path, process, str::FromStr, sync::Arc, time::UNIX_EPOCH};

use stratacache::{
    cache::{
        ArtifactCacheKey, ArtifactType, BuildError, BytesEncoder, BytesResolver, CacheConfig,
        CacheError, CacheKey, DigestKey, Engine, FileResolver, LoadRequest, Model, ORIGINAL_SIZE,
        Options, PassthroughStage, PersistentStore, Registry, SafeKeyGenerator, SourceCacheKey,
        TokioExecutor, TransformationId,
    },
    config::{self, DigestArgs, FetchArgs, LoadError, SizeArgs},
    infra::{disk_store::DiskStore, error::InfraError, telemetry},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    Usage(String),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Digest(args) => run_digest(args),
        config::Command::Fetch(args) => run_fetch(settings, args).await,
    }
}

fn run_digest(args: DigestArgs) -> Result<(), AppError> {
    let output_type = ArtifactType::from_str(&args.output).map_err(AppError::Usage)?;
    let model = Model::Uri(args.model);
    let signature = args.signature.map(CacheKey::Object).unwrap_or_default();
    let (width, height) = dimensions(args.size);

    // Reject dimensions a load would reject.
    LoadRequest::new(model.clone())
        .size(width, height)
        .signature(signature.clone())
        .types(output_type, output_type)
        .request_key()?;

    let source = SourceCacheKey::new(model.cache_key(), signature.clone());
    let artifact = ArtifactCacheKey::new(
        model.cache_key(),
        signature,
        width,
        height,
        args.transformation.map(TransformationId::new),
        output_type,
        Options::new(),
    );

    println!("source   {}", source.digest_hex());
    println!("artifact {}", artifact.digest_hex());
    Ok(())
}

async fn run_fetch(settings: config::Settings, args: FetchArgs) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let names = Arc::new(SafeKeyGenerator::new(
        cache_config.key_encoding_capacity_non_zero(),
    ));
    let executor = TokioExecutor::current()
        .map_err(|err| AppError::Usage(format!("no async runtime: {err}")))?;

    let mut builder = Engine::builder(Arc::new(default_registry()))
        .config(cache_config.clone())
        .key_names(names.clone())
        .executor(Arc::new(executor));
    if let Some(dir) = cache_config.disk_cache_dir.as_ref() {
        let store: Arc<dyn PersistentStore> = Arc::new(DiskStore::open(
            dir,
            names.clone(),
            cache_config.disk_cache_bytes,
        )?);
        builder = builder.store(store);
    }
    let engine = builder.build()?;

    let path = std::path::absolute(&args.path)?;
    let signature = file_signature(&path).await?;
    let (width, height) = dimensions(args.size);
    let model = Model::Path(path);
    let artifact_digest = ArtifactCacheKey::new(
        model.cache_key(),
        signature.clone(),
        width,
        height,
        None,
        ArtifactType::Bytes,
        Options::new(),
    )
    .digest_hex();

    for attempt in 1..=args.repeat {
        let mut request = LoadRequest::new(model.clone())
            .size(width, height)
            .signature(signature.clone());
        if let Some(strategy) = args.strategy {
            request = request.strategy(strategy);
        }

        let handle = engine.load(request)?.wait().await?;
        info!(
            attempt,
            provenance = ?handle.provenance(),
            bytes = handle.artifact().cost(),
            "Loaded"
        );
        println!(
            "{attempt}\t{:?}\t{} bytes\t{artifact_digest}",
            handle.provenance(),
            handle.artifact().cost()
        );
    }

    engine.shutdown();
    Ok(())
}

fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .append_resolver(Arc::new(FileResolver))
        .append_resolver(Arc::new(BytesResolver))
        .append_stage(Arc::new(PassthroughStage::new(ArtifactType::File)))
        .append_stage(Arc::new(PassthroughStage::new(ArtifactType::Bytes)))
        .register_encoder(ArtifactType::Bytes, Arc::new(BytesEncoder));
    registry
}

fn dimensions(size: SizeArgs) -> (i32, i32) {
    (
        size.width.unwrap_or(ORIGINAL_SIZE),
        size.height.unwrap_or(ORIGINAL_SIZE),
    )
}

/// Version marker that changes whenever the file is rewritten.
async fn file_signature(path: &Path) -> Result<CacheKey, AppError> {
    let metadata = tokio::fs::metadata(path).await?;
    let modified = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    Ok(CacheKey::Versioned {
        name: format!("len:{}", metadata.len()),
        version: modified,
    })
}
