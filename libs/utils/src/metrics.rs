//! Per-stream spool metrics, registered lazily on first segment
//! creation for a given stream name.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Registry};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static STREAM_METRICS: Lazy<Mutex<HashMap<String, StreamMetrics>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The counters and rate gauges kept for one stream's spool.
#[derive(Clone)]
pub struct StreamMetrics {
    pub write_count: IntCounter,
    pub read_count: IntCounter,
    pub write_per_sec: IntGauge,
    pub read_per_sec: IntGauge,
}

impl StreamMetrics {
    fn register(stream: &str) -> Self {
        let write_count = IntCounter::new(
            format!("spool_write_{stream}"),
            format!("Messages written to the {stream} spool"),
        )
        .expect("valid counter");
        let read_count = IntCounter::new(
            format!("spool_read_{stream}"),
            format!("Messages read back from the {stream} spool"),
        )
        .expect("valid counter");
        let write_per_sec = IntGauge::new(
            format!("spool_write_sec_{stream}"),
            format!("Write rate for the {stream} spool"),
        )
        .expect("valid gauge");
        let read_per_sec = IntGauge::new(
            format!("spool_read_sec_{stream}"),
            format!("Read rate for the {stream} spool"),
        )
        .expect("valid gauge");

        // Registration failing (duplicate metric) is tolerated: it only
        // happens when a stream's metrics were already registered, in
        // which case the already-registered collectors remain in effect.
        let _ = REGISTRY.register(Box::new(write_count.clone()));
        let _ = REGISTRY.register(Box::new(read_count.clone()));
        let _ = REGISTRY.register(Box::new(write_per_sec.clone()));
        let _ = REGISTRY.register(Box::new(read_per_sec.clone()));

        Self {
            write_count,
            read_count,
            write_per_sec,
            read_per_sec,
        }
    }
}

/// Returns the [`StreamMetrics`] for `stream`, registering them with
/// the process-wide registry on first use.
pub fn stream_metrics(stream: &str) -> StreamMetrics {
    let mut guard = STREAM_METRICS.lock().expect("metrics mutex poisoned");
    guard
        .entry(stream.to_string())
        .or_insert_with(|| StreamMetrics::register(stream))
        .clone()
}

/// The process-wide registry, for exposition (e.g. behind an HTTP
/// `/metrics` endpoint wired up by an embedder).
pub fn registry() -> &'static Registry {
    &REGISTRY
}
