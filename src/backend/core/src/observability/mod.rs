//! Observability: Distributed Tracing, Metrics, and Logging.

use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Initialize the observability stack.
///
/// `RUST_LOG` wins over the configured level when set. Every layer is
/// optional and stacked in one chain, so each sees the same subscriber.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let telemetry_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = otlp_tracer(service_name, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let (json_layer, pretty_layer) = if config.json_logging {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    Ok(())
}

fn otlp_tracer(service_name: &str, endpoint: &str) -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_resource(opentelemetry_sdk::Resource::new(vec![
                    opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                ])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;
    Ok(tracer)
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metrics registry and helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

    const DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

    /// Install the Prometheus recorder and return the handle used by `/metrics`.
    pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
        let handle = PrometheusBuilder::new()
            .set_buckets(DURATION_BUCKETS)?
            .install_recorder()?;
        register_metrics();
        Ok(handle)
    }

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!("relist_jobs_claimed_total", "Jobs moved from PENDING to RUNNING");
        describe_counter!(
            "relist_job_conflicts_total",
            "Claim attempts that hit a locked product"
        );
        describe_counter!(
            "relist_jobs_finished_total",
            "Jobs reaching a terminal status, by status"
        );
        describe_histogram!(
            "relist_job_duration_seconds",
            "Wall time from claim to terminal status"
        );
        describe_counter!(
            "relist_rpc_requests_total",
            "Executor RPC calls, by action and outcome"
        );
        describe_gauge!("relist_rpc_pending", "RPC calls awaiting a response");
        describe_gauge!(
            "relist_executor_connections",
            "Tenants with a connected executor"
        );
        describe_counter!("relist_keepalive_total", "Keepalive rounds, by outcome");
        describe_counter!(
            "relist_cleanup_transitions_total",
            "Jobs transitioned by the cleanup sweep, by rule"
        );
        describe_counter!("relist_errors_total", "Errors constructed, by code");
    }

    pub fn record_claimed() {
        counter!("relist_jobs_claimed_total").increment(1);
    }

    pub fn record_conflict() {
        counter!("relist_job_conflicts_total").increment(1);
    }

    /// Record a terminal transition.
    pub fn record_finished(status: &str, duration_secs: Option<f64>) {
        counter!("relist_jobs_finished_total", "status" => status.to_string()).increment(1);
        if let Some(secs) = duration_secs {
            histogram!("relist_job_duration_seconds").record(secs);
        }
    }

    pub fn record_rpc(action: &str, outcome: &'static str) {
        counter!(
            "relist_rpc_requests_total",
            "action" => action.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn set_rpc_pending(count: usize) {
        gauge!("relist_rpc_pending").set(count as f64);
    }

    pub fn set_executor_connections(count: usize) {
        gauge!("relist_executor_connections").set(count as f64);
    }

    pub fn record_keepalive(outcome: &'static str) {
        counter!("relist_keepalive_total", "outcome" => outcome).increment(1);
    }

    pub fn record_cleanup(rule: &'static str, count: u64) {
        if count > 0 {
            counter!("relist_cleanup_transitions_total", "rule" => rule).increment(count);
        }
    }
}
