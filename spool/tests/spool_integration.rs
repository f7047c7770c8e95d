use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use router_core::{ChannelRouter, Message, StreamId, ToggleSource};
use spool::{ProducerConfig, SpoolingProducer};
use utils::SpoolConfig;

fn test_config(path: &std::path::Path, max_file_size: u64) -> ProducerConfig {
    test_config_with_buffer(path, max_file_size, 8192)
}

fn test_config_with_buffer(path: &std::path::Path, max_file_size: u64, buffer_size_byte: u64) -> ProducerConfig {
    let mut overrides = HashMap::new();
    overrides.insert("path".to_string(), path.to_str().unwrap().to_string());
    overrides.insert("max_file_size".to_string(), max_file_size.to_string());
    overrides.insert("max_file_age".to_string(), "1h".to_string());
    overrides.insert("shutdown_timeout".to_string(), "2s".to_string());
    overrides.insert("batch_max_count".to_string(), "1".to_string());
    overrides.insert("buffer_size_byte".to_string(), buffer_size_byte.to_string());
    let spool = SpoolConfig::from_map(&overrides).unwrap();
    ProducerConfig {
        spool,
        drop_stream: StreamId::new("_DROPPED_", 0),
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn spl_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "spl").unwrap_or(false))
                .collect()
        })
        .unwrap_or_default()
}

fn failed_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.to_string_lossy().ends_with(".failed"))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn s4_rotates_by_size_under_sustained_writes() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), 64);

    let router: Arc<ChannelRouter> = Arc::new(ChannelRouter::new());
    // Keep the source blocked so the reader task does not race the
    // writer while we inspect the rotated file set.
    let source = Arc::new(ToggleSource::new(true));
    let producer = SpoolingProducer::new(config, router, source, Vec::new);

    for i in 0..10u32 {
        let msg = Message::new(format!("msg-{i:03}").into_bytes(), StreamId::new("orders", 1));
        producer.enqueue(msg).await;
    }

    let stream_dir = base.path().join("orders");
    let rotated = wait_until(|| spl_files(&stream_dir).len() >= 2, Duration::from_secs(2)).await;
    assert!(rotated, "expected at least two segment files after exceeding max_file_size");

    producer.shutdown().await;
}

#[tokio::test]
async fn s5_drains_and_deletes_once_unblocked() {
    let base = tempfile::tempdir().unwrap();
    let config = test_config(base.path(), 64);

    let router: Arc<ChannelRouter> = Arc::new(ChannelRouter::new());
    let mut rx = router.subscribe("orders");
    let source = Arc::new(ToggleSource::new(true));
    let producer = SpoolingProducer::new(config, router, source.clone(), Vec::new);

    for i in 0..10u32 {
        let msg = Message::new(format!("msg-{i:03}").into_bytes(), StreamId::new("orders", 1));
        producer.enqueue(msg).await;
    }

    let stream_dir = base.path().join("orders");
    wait_until(|| spl_files(&stream_dir).len() >= 2, Duration::from_secs(2)).await;

    producer.control(spool::SpoolControl::Roll).await;
    source.set_blocked(false);

    let mut received = 0usize;
    let all_received = tokio::time::timeout(Duration::from_secs(3), async {
        while received < 10 {
            if rx.recv().await.is_some() {
                received += 1;
            }
        }
    })
    .await
    .is_ok();
    assert!(all_received, "expected all 10 messages to be routed back");

    let drained = wait_until(|| failed_files(&stream_dir).is_empty(), Duration::from_secs(2)).await;
    assert!(drained);

    producer.shutdown().await;
}

#[tokio::test]
async fn s6_oversized_frame_quarantines_the_segment() {
    let base = tempfile::tempdir().unwrap();
    // A buffer this small cannot hold even one base64-encoded frame,
    // so the reader's first read on the rotated segment must fail
    // with a non-EOF framing error and quarantine the file.
    let config = test_config_with_buffer(base.path(), 1024 * 1024, 4);

    let router: Arc<ChannelRouter> = Arc::new(ChannelRouter::new());
    let _rx = router.subscribe("orders");
    let source = Arc::new(ToggleSource::new(true));
    let producer = SpoolingProducer::new(config, router, source.clone(), Vec::new);

    let msg = Message::new(b"hello".to_vec(), StreamId::new("orders", 1));
    producer.enqueue(msg).await;
    producer.control(spool::SpoolControl::Roll).await;

    let stream_dir = base.path().join("orders");
    wait_until(|| !spl_files(&stream_dir).is_empty(), Duration::from_secs(2)).await;

    source.set_blocked(false);

    let quarantined = wait_until(|| !failed_files(&stream_dir).is_empty(), Duration::from_secs(2)).await;
    assert!(quarantined, "expected the oversized segment frame to be quarantined");

    producer.shutdown().await;
}
