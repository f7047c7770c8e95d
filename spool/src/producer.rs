use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use router_core::{Formatter, Message, MessageSource, Router, StreamId};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, instrument};
use utils::{ShutdownFlag, SpoolConfig};

use crate::segment::SpoolSegment;

/// Rotation/batching parameters plus the base directory layout. Wraps
/// [`SpoolConfig`] with the one derived path helper every segment
/// needs.
#[derive(Clone)]
pub struct ProducerConfig {
    pub spool: SpoolConfig,
    pub drop_stream: StreamId,
}

impl ProducerConfig {
    pub fn path_for_stream(&self, stream: &str) -> PathBuf {
        PathBuf::from(&self.spool.path).join(stream)
    }
}

/// State shared, read-only after construction, between a
/// [`SpoolingProducer`] and every [`SpoolSegment`] it owns. Segments
/// hold a cheap `Arc` clone of this rather than a reference back to
/// the producer itself, so there is no ownership cycle between the
/// producer's segment map and the segments within it.
pub struct SharedContext {
    pub config: ProducerConfig,
    pub shutdown: Arc<ShutdownFlag>,
    pub router: Arc<dyn Router>,
    pub source: Arc<dyn MessageSource>,
    formatter_factory: Box<dyn Fn() -> Vec<Box<dyn Formatter>> + Send + Sync>,
}

impl SharedContext {
    pub fn build_formatters(&self) -> Vec<Box<dyn Formatter>> {
        (self.formatter_factory)()
    }
}

/// Operator control signals, delivered over the producer's control
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolControl {
    /// Stop accepting new appends, flush and close every segment.
    Stop,
    /// Force rotation of every stream's active segment.
    Roll,
}

/// Per-stream orchestrator: owns every stream's [`SpoolSegment`],
/// creates them lazily on first touch, and relays operator control
/// signals to them.
pub struct SpoolingProducer {
    ctx: Arc<SharedContext>,
    segments: Mutex<HashMap<String, Arc<SpoolSegment>>>,
}

impl SpoolingProducer {
    pub fn new(
        config: ProducerConfig,
        router: Arc<dyn Router>,
        source: Arc<dyn MessageSource>,
        formatter_factory: impl Fn() -> Vec<Box<dyn Formatter>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(SharedContext {
                config,
                shutdown: ShutdownFlag::new(),
                router,
                source,
                formatter_factory: Box::new(formatter_factory),
            }),
            segments: Mutex::new(HashMap::new()),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<ShutdownFlag> {
        self.ctx.shutdown.clone()
    }

    /// Dispatches `msg` to its origin stream's segment, creating (and
    /// spawning the reader task for) that segment on first touch.
    /// Never blocks longer than a non-blocking batch append plus, at
    /// worst, one synchronous flush retry.
    #[instrument(skip(self, msg), fields(stream = msg.origin().name()))]
    pub async fn enqueue(&self, msg: Message) {
        let segment = self.segment_for(msg.origin().clone()).await;
        segment.enqueue(msg).await;
    }

    /// Forwards `msg` to the configured drop stream.
    pub fn drop_message(&self, msg: Message) {
        self.ctx.router.enqueue(self.ctx.config.drop_stream.clone(), msg);
    }

    /// Re-injects `msg` at its original stream. Called from segment
    /// reader tasks after a successful decode.
    pub fn route_to_origin(&self, msg: Message) {
        self.ctx.router.route_to_origin(msg);
    }

    async fn segment_for(&self, stream: StreamId) -> Arc<SpoolSegment> {
        let mut guard = self.segments.lock().await;
        if let Some(segment) = guard.get(stream.name()) {
            return segment.clone();
        }
        let segment = SpoolSegment::spawn(stream.clone(), self.ctx.clone())
            .await
            .expect("failed to create spool segment directory");
        guard.insert(stream.name().to_string(), segment.clone());
        segment
    }

    /// Applies an operator control signal. `Stop` drains and closes
    /// every stream; `Roll` forces immediate rotation of every active
    /// segment.
    pub async fn control(&self, signal: SpoolControl) {
        match signal {
            SpoolControl::Stop => self.shutdown().await,
            SpoolControl::Roll => self.roll_all().await,
        }
    }

    async fn roll_all(&self) {
        let segments: Vec<_> = self.segments.lock().await.values().cloned().collect();
        for segment in segments {
            segment.flush().await;
            segment.force_rotate().await;
        }
    }

    /// Graceful shutdown: stop accepting appends, flush every batch,
    /// and close every segment file within the configured timeout.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("spooling producer shutting down");
        self.ctx.shutdown.stop();
        let segments: Vec<_> = self.segments.lock().await.values().cloned().collect();
        for segment in segments {
            segment.close().await;
        }
    }

    pub async fn stream_count(&self) -> usize {
        self.segments.lock().await.len()
    }

    pub async fn segment_counts(&self) -> HashMap<String, (u64, u64)> {
        self.segments
            .lock()
            .await
            .iter()
            .map(|(name, segment)| (name.clone(), (segment.write_count(), segment.read_count())))
            .collect()
    }
}

/// Spawns a task relaying [`SpoolControl`] signals from `control_rx`
/// into `producer.control`, exiting once the channel is closed.
pub fn spawn_control_loop(
    producer: Arc<SpoolingProducer>,
    mut control_rx: mpsc::UnboundedReceiver<SpoolControl>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = control_rx.recv().await {
            producer.control(signal).await;
        }
    })
}
