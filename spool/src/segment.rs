use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use batch::MessageBatch;
use bytes::Bytes;
use framed::{FramedReader, Framing};
use router_core::{Message, StreamId, WriterAssembly};
use tokio::fs::{self, File, OpenOptions};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use utils::metrics::{self, StreamMetrics};

use crate::producer::SharedContext;

/// Highest legal eight-digit segment suffix; matches the upstream
/// system's own `maxSpoolFileNumber`.
pub const MAX_SPOOL_FILE_NUMBER: u64 = 99_999_999;

fn segment_file_name(number: u64) -> String {
    format!("{number:08}.spl")
}

fn parse_segment_number(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(".spl")?.parse().ok()
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("io error on segment file: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment directory exhausted all {0} file numbers")]
    NumberingExhausted(u64),
}

/// One logical spool file for a single stream: an append-only writer
/// side (a [`MessageBatch`] plus [`WriterAssembly`]) and a reader task
/// that drains older, already-rotated files back through the router.
pub struct SpoolSegment {
    stream: String,
    dir: PathBuf,
    ctx: Arc<SharedContext>,
    batch: MessageBatch,
    writer: AsyncMutex<WriterAssembly>,
    current_file_number: AtomicU64,
    current_file_opened_at: AsyncMutex<Option<Instant>>,
    write_count: AtomicU64,
    read_count: AtomicU64,
    reader_handle: AsyncMutex<Option<JoinHandle<()>>>,
    created_at: Instant,
    metrics: StreamMetrics,
}

impl SpoolSegment {
    /// Creates the stream's spool directory, builds a segment, and
    /// spawns its reader task.
    pub async fn spawn(stream: StreamId, ctx: Arc<SharedContext>) -> Result<Arc<Self>, SegmentError> {
        let dir = ctx.config.path_for_stream(stream.name());
        fs::create_dir_all(&dir).await?;

        let segment = Arc::new(Self {
            metrics: metrics::stream_metrics(stream.name()),
            stream: stream.name().to_string(),
            dir,
            batch: MessageBatch::new(ctx.config.spool.batch_max_count),
            writer: AsyncMutex::new(WriterAssembly::new(ctx.build_formatters())),
            current_file_number: AtomicU64::new(0),
            current_file_opened_at: AsyncMutex::new(None),
            write_count: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
            reader_handle: AsyncMutex::new(None),
            created_at: Instant::now(),
            ctx,
        });

        let reader_segment = segment.clone();
        let handle = tokio::spawn(async move {
            reader_segment.read_loop().await;
        });
        *segment.reader_handle.lock().await = Some(handle);

        Ok(segment)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Appends `msg` to the active batch. On rejection (buffer full or
    /// closed for rotation), triggers a flush and retries once before
    /// routing the message to the configured drop stream.
    pub async fn enqueue(&self, msg: Message) {
        if self.open_or_rotate().await {
            // Best effort: a failed rotation still lets an existing
            // open file accept more writes.
        }

        if self.batch.append(msg.clone()) == batch::AppendOutcome::Accepted {
            self.write_count.fetch_add(1, Ordering::Relaxed);
            self.metrics.write_count.inc();
            self.update_write_rate();
            return;
        }

        self.flush().await;

        if self.batch.append(msg.clone()) == batch::AppendOutcome::Accepted {
            self.write_count.fetch_add(1, Ordering::Relaxed);
            self.metrics.write_count.inc();
            self.update_write_rate();
            return;
        }

        warn!(stream = %self.stream, "batch rejected message twice, routing to drop stream");
        self.ctx.router.enqueue(self.ctx.config.drop_stream.clone(), msg);
    }

    pub async fn flush(&self) {
        let writer = &self.writer;
        let result = self
            .batch
            .flush(|messages| async move {
                if messages.is_empty() {
                    return Ok(());
                }
                let mut guard = writer.lock().await;
                guard.write(&messages).await
            })
            .await;

        if let Err(err) = result {
            warn!(stream = %self.stream, error = %err, "segment flush failed");
        }
    }

    /// Opens a new segment file when none is open, the active file has
    /// grown past `max_file_size`, or it is non-empty and older than
    /// `max_file_age`. Returns false (and logs) on any I/O failure.
    pub async fn open_or_rotate(&self) -> bool {
        self.rotate(false).await
    }

    /// Unconditionally rotates to a new segment file regardless of the
    /// current file's size or age, bypassing `needs_rotation`. Used by
    /// `SpoolControl::Roll`.
    pub async fn force_rotate(&self) -> bool {
        self.rotate(true).await
    }

    async fn rotate(&self, force: bool) -> bool {
        if !force && !self.needs_rotation().await {
            return true;
        }

        let dir = self.dir.clone();
        let stream = self.stream.clone();
        let result = self
            .batch
            .after_flush_do(move || futures_rotate(dir, stream))
            .await;

        match result {
            Ok(Ok(next_number)) => {
                match self.open_file(next_number).await {
                    Ok(()) => true,
                    Err(err) => {
                        error!(stream = %self.stream, error = %err, "failed to open rotated segment file");
                        false
                    }
                }
            }
            Ok(Err(err)) => {
                error!(stream = %self.stream, error = %err, "failed to determine next segment number");
                false
            }
            Err(_) => false,
        }
    }

    async fn needs_rotation(&self) -> bool {
        if self.current_file_number.load(Ordering::Acquire) == 0 {
            return true;
        }
        let path = self.active_path();
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => return true,
        };
        if size >= self.ctx.config.spool.max_file_size {
            return true;
        }
        if size > 0 {
            if let Some(opened_at) = *self.current_file_opened_at.lock().await {
                if opened_at.elapsed() >= self.ctx.config.spool.max_file_age {
                    return true;
                }
            }
        }
        false
    }

    fn update_write_rate(&self) {
        let elapsed = self.created_at.elapsed().as_secs().max(1);
        self.metrics
            .write_per_sec
            .set((self.write_count() / elapsed) as i64);
    }

    fn update_read_rate(&self) {
        let elapsed = self.created_at.elapsed().as_secs().max(1);
        self.metrics
            .read_per_sec
            .set((self.read_count() / elapsed) as i64);
    }

    fn active_path(&self) -> PathBuf {
        let number = self.current_file_number.load(Ordering::Acquire);
        self.dir.join(segment_file_name(number))
    }

    async fn open_file(&self, number: u64) -> Result<(), SegmentError> {
        let path = self.dir.join(segment_file_name(number));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        self.writer.lock().await.set_writer(Some(file));
        self.current_file_number.store(number, Ordering::Release);
        *self.current_file_opened_at.lock().await = Some(Instant::now());
        debug!(stream = %self.stream, path = %path.display(), "opened segment file");
        Ok(())
    }

    /// Scans the stream directory for `*.spl` files and returns
    /// `(min_suffix + 0, max_suffix)`. `min` is `max_spool_file_number +
    /// 1` when the directory holds nothing to read.
    pub async fn file_numbering(&self) -> Result<(u64, u64), SegmentError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut min = None;
        let mut max = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(number) = parse_segment_number(name) else { continue };
            min = Some(min.map_or(number, |m: u64| m.min(number)));
            max = max.max(number);
        }
        Ok((min.unwrap_or(MAX_SPOOL_FILE_NUMBER + 1), max))
    }

    /// Flushes and closes the active file, waiting up to the
    /// configured shutdown timeout for a pending drain.
    pub async fn close(&self) {
        if !self.batch.is_empty() {
            self.flush().await;
            let _ = self
                .batch
                .wait_for_flush(self.ctx.config.spool.shutdown_timeout)
                .await;
        }
        self.writer.lock().await.set_writer(None);
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn read_loop(self: Arc<Self>) {
        let mut reader = FramedReader::new(self.ctx.config.spool.buffer_size_byte, Framing::delimiter("\n"));

        while !self.ctx.shutdown.is_stopping() {
            let (min, _max) = match self.file_numbering().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(stream = %self.stream, error = %err, "failed to scan spool directory");
                    tokio::time::sleep(self.half_max_age()).await;
                    continue;
                }
            };

            let writing_number = self.current_file_number.load(Ordering::Acquire);
            if min == 0 || min > MAX_SPOOL_FILE_NUMBER || min == writing_number {
                tokio::time::sleep(self.half_max_age()).await;
                continue;
            }

            let path = self.dir.join(segment_file_name(min));
            let mut read_failed = false;

            match File::open(&path).await {
                Ok(mut file) => {
                    reader.reset(0);
                    loop {
                        if self.ctx.shutdown.is_stopping() {
                            break;
                        }
                        if self.ctx.source.is_blocked() {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }

                        let segment = self.clone();
                        let outcome = reader
                            .read(&mut file, |frame, _sequence| {
                                segment.decode(frame);
                            })
                            .await;

                        match outcome {
                            Ok(()) => break,
                            Err(err) => {
                                error!(stream = %self.stream, error = %err, "segment read failed");
                                read_failed = true;
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(stream = %self.stream, error = %err, "failed to open segment file for reading");
                    tokio::time::sleep(self.half_max_age()).await;
                    continue;
                }
            }

            if read_failed {
                let quarantined = path.with_extension("spl.failed");
                if let Err(err) = fs::rename(&path, &quarantined).await {
                    error!(stream = %self.stream, error = %err, "failed to quarantine corrupt segment");
                }
            } else if let Err(err) = fs::remove_file(&path).await {
                warn!(stream = %self.stream, error = %err, "failed to delete drained segment");
            }
        }
    }

    fn half_max_age(&self) -> Duration {
        self.ctx.config.spool.max_file_age / 2
    }

    /// Base64-decodes and deserializes one frame, then re-injects the
    /// resulting message at its original stream. Malformed frames are
    /// logged and dropped; the stream continues.
    fn decode(&self, frame: Bytes) {
        let decoded = match base64::engine::general_purpose::STANDARD.decode(frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(stream = %self.stream, error = %err, "dropping frame with invalid base64");
                return;
            }
        };

        match router_core::deserialize(Bytes::from(decoded)) {
            Ok(mut msg) => {
                self.read_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.read_count.inc();
                self.update_read_rate();
                // The wire format only carries the numeric stream id
                // (see DESIGN.md); the name is this segment's own
                // stream, since every segment belongs to exactly one
                // stream's directory.
                let origin = StreamId::new(self.stream.clone(), msg.origin().id());
                msg.set_origin(origin);
                self.ctx.router.route_to_origin(msg);
            }
            Err(err) => {
                warn!(stream = %self.stream, error = %err, "dropping frame with invalid message encoding");
            }
        }
    }
}

async fn futures_rotate(dir: PathBuf, stream: String) -> Result<u64, SegmentError> {
    let mut entries = fs::read_dir(&dir).await?;
    let mut max = 0u64;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(number) = parse_segment_number(name) {
            max = max.max(number);
        }
    }
    let next = max + 1;
    if next > MAX_SPOOL_FILE_NUMBER {
        return Err(SegmentError::NumberingExhausted(MAX_SPOOL_FILE_NUMBER));
    }
    debug!(stream = %stream, next, "rotating to new segment number");
    Ok(next)
}
