mod tracker;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    self, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec,
};

pub use tracker::Tracker;

static DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sentinel_router_dispatch",
            "commands dispatched by node role and command kind"
        ),
        &["role", "kind"]
    )
    .expect("dispatch counter registration must succeed")
});

static COMMUNICATION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sentinel_router_communication_failure",
            "connection level failures per node alias"
        ),
        &["alias"]
    )
    .expect("communication failure counter registration must succeed")
});

static RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("sentinel_router_retry", "retries per node alias"),
        &["alias"]
    )
    .expect("retry counter registration must succeed")
});

static RETRIES_EXHAUSTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sentinel_router_retries_exhausted",
            "commands abandoned after the retry limit per node alias"
        ),
        &["alias"]
    )
    .expect("retries exhausted counter registration must succeed")
});

static TOPOLOGY_RELOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "sentinel_router_topology_reload",
            "topology replacements by trigger"
        ),
        &["trigger"]
    )
    .expect("topology reload counter registration must succeed")
});

static DISPATCH_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "sentinel_router_dispatch_timer",
        "round-trip time of one dispatch attempt in microseconds",
        &["role"],
        vec![1_000.0, 10_000.0, 100_000.0, 1_000_000.0]
    )
    .expect("dispatch timer histogram registration must succeed")
});

pub fn dispatch(role: &str, kind: &str) {
    DISPATCHES.with_label_values(&[role, kind]).inc();
}

pub fn communication_failure(alias: &str) {
    COMMUNICATION_FAILURES.with_label_values(&[alias]).inc();
}

pub fn retry(alias: &str) {
    RETRIES.with_label_values(&[alias]).inc();
}

pub fn retries_exhausted(alias: &str) {
    RETRIES_EXHAUSTED.with_label_values(&[alias]).inc();
}

pub fn topology_reload(trigger: &str) {
    TOPOLOGY_RELOADS.with_label_values(&[trigger]).inc();
}

/// Create a tracker for the latency of one dispatch attempt.
pub fn dispatch_tracker(role: &str) -> Tracker {
    Tracker::new(DISPATCH_TIMER.with_label_values(&[role]))
}

/// Render every registered metric in the prometheus text format.
pub fn encode_text() -> Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode prometheus metrics")?;
    String::from_utf8(buffer).context("prometheus output is not utf-8")
}

#[cfg(test)]
pub(crate) fn retry_count(alias: &str) -> u64 {
    RETRIES.with_label_values(&[alias]).get()
}

#[cfg(test)]
pub(crate) fn exhausted_count(alias: &str) -> u64 {
    RETRIES_EXHAUSTED.with_label_values(&[alias]).get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        dispatch("replica", "read");
        topology_reload("unit-test");
        {
            let _tracker = dispatch_tracker("replica");
        }
        let text = encode_text().unwrap();
        assert!(text.contains("sentinel_router_dispatch"));
        assert!(text.contains("trigger=\"unit-test\""));
        assert!(text.contains("sentinel_router_dispatch_timer"));
    }

    #[test]
    fn retry_counters_are_per_alias() {
        let before = retry_count("metrics-test-alias");
        retry("metrics-test-alias");
        retry("metrics-test-alias");
        assert_eq!(retry_count("metrics-test-alias"), before + 2);
        retries_exhausted("metrics-test-alias");
        assert!(exhausted_count("metrics-test-alias") >= 1);
    }
}
