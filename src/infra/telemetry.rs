use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the engine emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "stratacache_live_hit_total",
            Unit::Count,
            "Loads served from an artifact some caller still holds."
        );
        describe_counter!(
            "stratacache_memory_hit_total",
            Unit::Count,
            "Loads served from the memory tier."
        );
        describe_counter!(
            "stratacache_memory_miss_total",
            Unit::Count,
            "Memory tier lookups that found nothing."
        );
        describe_counter!(
            "stratacache_memory_evict_total",
            Unit::Count,
            "Artifacts evicted from the memory tier over its byte budget."
        );
        describe_counter!(
            "stratacache_job_started_total",
            Unit::Count,
            "Load jobs started."
        );
        describe_counter!(
            "stratacache_job_joined_total",
            Unit::Count,
            "Loads that joined a job already in flight for the same key."
        );
        describe_counter!(
            "stratacache_job_failed_total",
            Unit::Count,
            "Load jobs that exhausted every source."
        );
        describe_gauge!(
            "stratacache_active_jobs",
            Unit::Count,
            "Load jobs currently running."
        );
        describe_counter!(
            "stratacache_persistent_write_total",
            Unit::Count,
            "Entries written to a persistent tier, labelled by tier."
        );
        describe_counter!(
            "stratacache_decode_stage_failed_total",
            Unit::Count,
            "Decode stage attempts that failed."
        );
        describe_histogram!(
            "stratacache_decode_ms",
            Unit::Milliseconds,
            "Latency of successful decodes in milliseconds."
        );
        describe_counter!(
            "stratacache_recycle_deferred_total",
            Unit::Count,
            "Recycles handed to the background scheduler."
        );
        describe_counter!(
            "stratacache_disk_evict_total",
            Unit::Count,
            "Entries evicted from the disk store over its byte budget."
        );
        describe_gauge!(
            "stratacache_disk_bytes",
            Unit::Bytes,
            "Bytes currently held by the disk store."
        );
    });
}
