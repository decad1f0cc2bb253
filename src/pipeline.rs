use crate::buffer::SampleBuffer;
use crate::sink::{SampleSink, SinkError};
use crate::telemetry::Sample;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Stopped => "stopped",
            ListenerState::Starting => "starting",
            ListenerState::Listening => "listening",
            ListenerState::Stopping => "stopping",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ListenerState::Starting,
            2 => ListenerState::Listening,
            3 => ListenerState::Stopping,
            _ => ListenerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ListenerState::Stopped => 0,
            ListenerState::Starting => 1,
            ListenerState::Listening => 2,
            ListenerState::Stopping => 3,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters shared by the listener, the scheduler and the control plane.
#[derive(Debug)]
pub struct IngestStats {
    state: AtomicU8,
    pub packets_received: AtomicU64,
    pub samples_received: AtomicU64,
    pub decode_failures: AtomicU64,
    pub socket_errors: AtomicU64,
    pub samples_flushed: AtomicU64,
    pub samples_lost: AtomicU64,
    pub flush_failures: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ListenerState::Stopped.as_u8()),
            packets_received: AtomicU64::new(0),
            samples_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            samples_flushed: AtomicU64::new(0),
            samples_lost: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ListenerState) {
        let previous = ListenerState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "listener state changed");
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self, buffer_len: usize) -> StatsSnapshot {
        let state = self.state();
        StatsSnapshot {
            state,
            running: state == ListenerState::Listening,
            buffer_len: buffer_len as u64,
            last_flush_unix_ms: self.last_flush_unix_ms.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            samples_received: self.samples_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            samples_flushed: self.samples_flushed.load(Ordering::Relaxed),
            samples_lost: self.samples_lost.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            last_batch_len: self.last_batch_len.load(Ordering::Relaxed),
            average_flush_ms: self.average_flush_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the service for health queries.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub state: ListenerState,
    pub running: bool,
    pub buffer_len: u64,
    pub last_flush_unix_ms: u64,
    pub packets_received: u64,
    pub samples_received: u64,
    pub decode_failures: u64,
    pub socket_errors: u64,
    pub samples_flushed: u64,
    pub samples_lost: u64,
    pub flush_failures: u64,
    pub last_batch_len: u64,
    pub average_flush_ms: f64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    pub max_size: usize,
    pub flush_interval: Duration,
    pub check_interval: Duration,
    pub sink_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered; the sink was not called.
    Empty,
    Written { samples: usize },
    /// The batch was dropped after the sink failed.
    Failed { lost: usize, error: String },
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Size,
    Interval,
    Demand,
    Shutdown,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Interval => "interval",
            FlushReason::Demand => "demand",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
enum FlushCommand {
    Flush(oneshot::Sender<FlushOutcome>),
    Shutdown(oneshot::Sender<FlushOutcome>),
}

/// Listener/control-plane side of the pipeline: appends samples and asks the
/// scheduler for flushes. Never performs a sink write itself.
#[derive(Clone)]
pub struct PipelineHandle {
    buffer: Arc<SampleBuffer>,
    stats: Arc<IngestStats>,
    size_trigger: Arc<Notify>,
    commands: mpsc::Sender<FlushCommand>,
    max_size: usize,
}

impl PipelineHandle {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.size()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.buffer.size())
    }

    /// Buffers a decoded sample; crossing `max_size` wakes the scheduler
    /// without waiting for its next tick.
    pub fn ingest(&self, sample: Sample) {
        let len = self.buffer.append(sample);
        self.stats.samples_received.fetch_add(1, Ordering::Relaxed);
        if len >= self.max_size {
            tracing::trace!(len, "size threshold crossed");
            self.size_trigger.notify_one();
        }
    }

    pub async fn flush(&self) -> Result<FlushOutcome> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(FlushCommand::Flush(tx))
            .await
            .map_err(|_| anyhow!("flush scheduler has stopped"))?;
        rx.await.map_err(|_| anyhow!("flush scheduler has stopped"))
    }

    /// Requests the final flush; the scheduler exits after answering.
    pub async fn shutdown(&self) -> Result<FlushOutcome> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(FlushCommand::Shutdown(tx))
            .await
            .map_err(|_| anyhow!("flush scheduler has stopped"))?;
        rx.await.map_err(|_| anyhow!("flush scheduler has stopped"))
    }
}

pub fn spawn_scheduler<S: SampleSink>(
    sink: Arc<S>,
    stats: Arc<IngestStats>,
    settings: FlushSettings,
) -> (PipelineHandle, JoinHandle<()>) {
    let buffer = Arc::new(SampleBuffer::with_capacity(settings.max_size));
    let size_trigger = Arc::new(Notify::new());
    let (tx, rx) = mpsc::channel(8);

    let handle = PipelineHandle {
        buffer: buffer.clone(),
        stats: stats.clone(),
        size_trigger: size_trigger.clone(),
        commands: tx,
        max_size: settings.max_size,
    };
    let scheduler = Scheduler {
        buffer,
        sink,
        stats,
        settings,
        last_flush: Instant::now(),
    };
    let task = tokio::spawn(scheduler.run(rx, size_trigger));
    (handle, task)
}

struct Scheduler<S> {
    buffer: Arc<SampleBuffer>,
    sink: Arc<S>,
    stats: Arc<IngestStats>,
    settings: FlushSettings,
    last_flush: Instant,
}

impl<S: SampleSink> Scheduler<S> {
    async fn run(mut self, mut commands: mpsc::Receiver<FlushCommand>, size_trigger: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.settings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.last_flush = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(reason) = self.due() {
                        self.flush(reason).await;
                    }
                }
                _ = size_trigger.notified() => {
                    if self.buffer.size() >= self.settings.max_size {
                        self.flush(FlushReason::Size).await;
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(FlushCommand::Flush(done)) => {
                            let outcome = self.flush(FlushReason::Demand).await;
                            let _ = done.send(outcome);
                        }
                        Some(FlushCommand::Shutdown(done)) => {
                            let outcome = self.flush(FlushReason::Shutdown).await;
                            let _ = done.send(outcome);
                            break;
                        }
                        None => {
                            self.flush(FlushReason::Shutdown).await;
                            break;
                        }
                    }
                }
            }
        }
        if !self.buffer.is_empty() {
            tracing::warn!(
                pending = self.buffer.size(),
                "samples arrived after the final flush and were not written"
            );
        }
        tracing::debug!("flush scheduler stopped");
    }

    fn due(&self) -> Option<FlushReason> {
        if self.buffer.size() >= self.settings.max_size {
            Some(FlushReason::Size)
        } else if self.last_flush.elapsed() >= self.settings.flush_interval {
            Some(FlushReason::Interval)
        } else {
            None
        }
    }

    async fn flush(&mut self, reason: FlushReason) -> FlushOutcome {
        let batch = self.buffer.drain_all();
        // Advanced on every attempt so a failing sink is not hammered between ticks.
        self.last_flush = Instant::now();
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        self.stats.last_flush_unix_ms.store(now_ms, Ordering::Relaxed);

        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let len = batch.len();
        let started = Instant::now();
        let timeout = self.settings.sink_timeout;
        let result = match tokio::time::timeout(timeout, self.sink.write_batch(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout)),
        };
        drop(batch);

        match result {
            Ok(()) => {
                self.stats
                    .samples_flushed
                    .fetch_add(len as u64, Ordering::Relaxed);
                self.stats.last_batch_len.store(len as u64, Ordering::Relaxed);
                let micros = started.elapsed().as_micros() as u64;
                let prev = self.stats.average_flush_micros.load(Ordering::Relaxed);
                let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
                self.stats.average_flush_micros.store(avg, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(len, micros, reason = reason.as_str(), "flushed grid samples");
                FlushOutcome::Written { samples: len }
            }
            Err(err) => {
                self.stats
                    .samples_lost
                    .fetch_add(len as u64, Ordering::Relaxed);
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(
                    error = %err,
                    lost = len,
                    reason = reason.as_str(),
                    "failed to write grid samples; batch dropped"
                );
                FlushOutcome::Failed {
                    lost: len,
                    error: err.to_string(),
                }
            }
        }
    }
}
