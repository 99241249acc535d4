//! Prometheus metrics exposition
//!
//! The runner crates emit through the `metrics` facade:
//!
//! - `workflow_items_total` (counter): label `outcome`
//! - `workflow_item_duration_seconds` (histogram)
//! - `workflow_upstream_errors_total` (counter): label `category`
//! - `credential_pool_exhausted_total`, `credential_pool_rate_limited_total`,
//!   `credential_pool_disabled_total` (counters)
//!
//! This module adds the pool gauges and installs the exporter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use credential_pool::Pool;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use tokio_util::sync::CancellationToken;

/// Item durations range from sub-second dry commands to multi-minute agent runs.
const ITEM_DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
];

/// How often the pool gauges are refreshed while a run is in progress.
pub const POOL_GAUGE_INTERVAL: Duration = Duration::from_secs(5);

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("workflow_item_duration_seconds".to_string()),
        ITEM_DURATION_BUCKETS,
    )
}

/// Install the global recorder and serve `/metrics` on `addr`.
///
/// Must be called from within the Tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    builder()?.with_http_listener(addr).install()
}

/// Record the pool's current occupancy.
pub fn record_pool_state(pool: &Pool) {
    metrics::gauge!("credential_pool_size").set(pool.len() as f64);
    metrics::gauge!("credential_pool_available").set(pool.available_count() as f64);
}

/// Refresh the pool gauges every [`POOL_GAUGE_INTERVAL`] until `stop` fires.
pub async fn track_pool(pool: Arc<Pool>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(POOL_GAUGE_INTERVAL);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => record_pool_state(&pool),
        }
    }
    record_pool_state(&pool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusHandle, PrometheusRecorder};
    use runner::{Coordinator, RunnerOptions, SharedSink, WorkContext, WorkError};

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        // When no recorder is installed, metrics calls are no-ops.
        record_pool_state(&Pool::new(["sk-a"]));
    }

    /// Create an isolated recorder/handle pair for unit tests.
    /// Uses build_recorder() instead of install() because only one global
    /// recorder can exist per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder()
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn pool_gauges_render() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let pool = Pool::new(["sk-a", "sk-b", "sk-c"]);
        pool.disable("cred-2");
        record_pool_state(&pool);

        let output = handle.render();
        assert!(output.contains("credential_pool_size 3"), "{output}");
        assert!(output.contains("credential_pool_available 2"), "{output}");
    }

    // current_thread so spawned item tasks run on the thread holding the
    // local recorder.
    #[tokio::test(flavor = "current_thread")]
    async fn run_metrics_render_with_buckets_and_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let (sink, _) = SharedSink::buffer();
        let coordinator = Coordinator::new(RunnerOptions::default())
            .unwrap()
            .with_sink(sink);
        coordinator
            .execute(
                vec!["ok".to_string(), "bad".to_string()],
                |item: Arc<String>, _ctx: WorkContext| async move {
                    match item.as_str() {
                        "bad" => Err(WorkError::upstream(Some(429), "quota exceeded for this account")),
                        _ => Ok(()),
                    }
                },
                |id: &String| id.clone(),
                false,
            )
            .await;

        let output = handle.render();
        assert!(output.contains("workflow_items_total{outcome=\"succeeded\"} 1"), "{output}");
        assert!(output.contains("workflow_items_total{outcome=\"failed\"} 1"), "{output}");
        assert!(
            output.contains("workflow_upstream_errors_total{category=\"quota_exhausted\"} 1"),
            "{output}"
        );
        assert!(
            output.contains("workflow_item_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"1800\""), "{output}");
    }

    #[tokio::test(start_paused = true)]
    async fn track_pool_stops_on_cancel() {
        let pool = Arc::new(Pool::new(["sk-a"]));
        let stop = CancellationToken::new();
        let task = tokio::spawn(track_pool(Arc::clone(&pool), stop.clone()));
        tokio::time::sleep(POOL_GAUGE_INTERVAL * 2).await;
        stop.cancel();
        task.await.unwrap();
    }
}
