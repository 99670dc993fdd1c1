//! Subscriber setup. Runs in its own binary: the global subscriber can only
//! be installed once per process.

use relist_core::config::ObservabilityConfig;
use relist_core::observability;

#[tokio::test(flavor = "multi_thread")]
async fn test_init_stacks_every_layer_once() {
    let config = ObservabilityConfig {
        otlp_endpoint: Some("http://127.0.0.1:4317".to_string()),
        log_level: "debug".to_string(),
        json_logging: true,
    };

    observability::init("relist-test", &config).unwrap();
    tracing::info!(job_id = 1, "Subscriber installed");

    // A second install is refused rather than replacing the first.
    let err = observability::init("relist-test", &ObservabilityConfig::default());
    assert!(err.is_err());
}
