use crate::config::Config;
use crate::pipeline::{
    spawn_scheduler, FlushOutcome, FlushSettings, IngestStats, ListenerState, PipelineHandle,
};
use crate::sink::SampleSink;
use crate::udp::{run_listener, ListenerSettings};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("UDP socket failed: {0}")]
    Socket(#[source] io::Error),
    #[error("listener task failed: {0}")]
    Task(#[from] JoinError),
}

/// A bound listener plus its flush scheduler.
pub struct RunningService {
    local_addr: SocketAddr,
    pipeline: PipelineHandle,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
}

impl RunningService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pipeline(&self) -> PipelineHandle {
        self.pipeline.clone()
    }

    /// Resolves when the listener stops on its own. Safe to use in `select!`.
    pub async fn wait(&mut self) -> Result<(), ServiceError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        joined?
    }

    /// Signals the listener and waits for the final flush and `Stopped`.
    pub async fn shutdown(mut self) -> Result<(), ServiceError> {
        let _ = self.shutdown.send(true);
        self.wait().await
    }
}

/// Binds the UDP socket and, only once that succeeds, starts the scheduler
/// and the listener.
pub async fn start<S: SampleSink>(
    config: &Config,
    sink: Arc<S>,
    stats: Arc<IngestStats>,
) -> Result<RunningService, ServiceError> {
    stats.set_state(ListenerState::Starting);
    let addr = config.listen_addr();
    let bound = match UdpSocket::bind(&addr).await {
        Ok(socket) => socket.local_addr().map(|local| (socket, local)),
        Err(err) => Err(err),
    };
    let (socket, local_addr) = match bound {
        Ok(bound) => bound,
        Err(source) => {
            stats.set_state(ListenerState::Stopped);
            stats.record_error(format!("bind {addr}: {source}"));
            return Err(ServiceError::Bind { addr, source });
        }
    };

    let (pipeline, scheduler) = spawn_scheduler(
        sink,
        stats.clone(),
        FlushSettings {
            max_size: config.buffer_max_size,
            flush_interval: config.flush_interval(),
            check_interval: config.flush_check_interval(),
            sink_timeout: config.influx_timeout(),
        },
    );
    let settings = ListenerSettings {
        format: config.data_format,
        recv_timeout: config.recv_timeout(),
        max_datagram: config.udp_buffer_size,
    };
    let (shutdown, shutdown_rx) = watch::channel(false);
    // Published before returning so callers never observe `Starting` after a good bind.
    stats.set_state(ListenerState::Listening);
    let listener = run_listener(socket, settings, pipeline.clone(), shutdown_rx);
    let task = tokio::spawn(supervise(listener, pipeline.clone(), scheduler));

    Ok(RunningService {
        local_addr,
        pipeline,
        shutdown,
        task: Some(task),
    })
}

/// Runs the listener to completion, then Stopping, the final flush, Stopped.
async fn supervise<F>(
    listener: F,
    pipeline: PipelineHandle,
    scheduler: JoinHandle<()>,
) -> Result<(), ServiceError>
where
    F: Future<Output = Result<(), ServiceError>>,
{
    let stats = pipeline.stats();
    // The listener owns the socket, so it is closed by the time this returns.
    let result = listener.await;
    stats.set_state(ListenerState::Stopping);

    match pipeline.shutdown().await {
        Ok(FlushOutcome::Failed { lost, error }) => {
            tracing::warn!(lost, %error, "final flush failed");
        }
        Ok(outcome) => tracing::info!(?outcome, "final flush complete"),
        Err(err) => tracing::warn!(error = %err, "final flush skipped"),
    }
    if let Err(err) = scheduler.await {
        tracing::warn!(error = %err, "flush scheduler task failed");
    }

    stats.set_state(ListenerState::Stopped);
    tracing::info!("grid listener stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use crate::sink::SinkError;
    use crate::telemetry::{encode_binary, test_sample, Sample};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the listener state seen by each write.
    struct StateAtWriteSink {
        stats: Arc<IngestStats>,
        writes: Mutex<Vec<(ListenerState, usize)>>,
    }

    impl SampleSink for StateAtWriteSink {
        async fn write_batch(&self, batch: &[Sample]) -> Result<(), SinkError> {
            self.writes
                .lock()
                .expect("writes lock")
                .push((self.stats.state(), batch.len()));
            Ok(())
        }
    }

    fn config(port: u16, max_size: usize) -> Config {
        let map: HashMap<String, String> = [
            ("UDP_HOST", "127.0.0.1".to_string()),
            ("UDP_PORT", port.to_string()),
            ("UDP_TIMEOUT", "0.05".to_string()),
            ("BUFFER_MAX_SIZE", max_size.to_string()),
            ("BUFFER_FLUSH_INTERVAL", "3600".to_string()),
            ("FLUSH_CHECK_INTERVAL_MS", "3600000".to_string()),
            ("GRID_GRPC_SOCKET", String::new()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
        Config::from_lookup(move |key: &str| map.get(key).cloned()).expect("config")
    }

    async fn send_samples(target: SocketAddr, range: std::ops::Range<u32>) {
        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        for seq in range {
            sender
                .send_to(&encode_binary(&test_sample(seq)), target)
                .await
                .expect("send");
        }
    }

    async fn wait_for_samples(pipeline: &PipelineHandle, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.snapshot().samples_received < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("samples arrive");
    }

    #[tokio::test]
    async fn shutdown_delivers_pending_samples_in_one_final_flush() {
        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(IngestStats::new());
        let service = start(&config(0, 1000), sink.clone(), stats.clone())
            .await
            .expect("start");
        assert_eq!(stats.state(), ListenerState::Listening);
        assert!(service.pipeline().snapshot().running);

        send_samples(service.local_addr(), 0..25).await;
        wait_for_samples(&service.pipeline(), 25).await;
        assert_eq!(sink.batch_count(), 0);

        service.shutdown().await.expect("clean shutdown");
        assert_eq!(stats.state(), ListenerState::Stopped);
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let order: Vec<u32> = batches[0].iter().map(|s| s.bus_voltage as u32).collect();
        assert_eq!(order, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn burst_reaching_max_size_is_flushed_while_listening() {
        let sink = Arc::new(RecordingSink::default());
        let service = start(&config(0, 5), sink.clone(), Arc::new(IngestStats::new()))
            .await
            .expect("start");

        send_samples(service.local_addr(), 0..5).await;
        tokio::time::timeout(Duration::from_secs(5), sink.wait_for_batches(1))
            .await
            .expect("size-triggered flush");
        assert_eq!(sink.sample_count(), 5);
        assert_eq!(service.pipeline().buffer_len(), 0);

        service.shutdown().await.expect("clean shutdown");
        assert_eq!(sink.batch_count(), 1);
    }

    #[tokio::test]
    async fn bind_on_an_occupied_port_fails() {
        let occupant = std::net::UdpSocket::bind("127.0.0.1:0").expect("occupy");
        let port = occupant.local_addr().expect("addr").port();
        let stats = Arc::new(IngestStats::new());

        let err = match start(
            &config(port, 10),
            Arc::new(RecordingSink::default()),
            stats.clone(),
        )
        .await
        {
            Ok(_) => panic!("bind should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, ServiceError::Bind { .. }), "{err}");
        assert_eq!(stats.state(), ListenerState::Stopped);
        assert!(stats.snapshot(0).last_error.is_some());
    }

    #[tokio::test]
    async fn wait_resolves_after_shutdown_is_signalled_elsewhere() {
        let mut service = start(
            &config(0, 10),
            Arc::new(RecordingSink::default()),
            Arc::new(IngestStats::new()),
        )
        .await
        .expect("start");
        let _ = service.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(2), service.wait())
            .await
            .expect("listener exits")
            .expect("clean exit");
        // A second wait has nothing left to join.
        service.wait().await.expect("idempotent wait");
    }

    #[tokio::test]
    async fn state_is_listening_as_soon_as_start_returns() {
        let stats = Arc::new(IngestStats::new());
        let service = start(
            &config(0, 10),
            Arc::new(RecordingSink::default()),
            stats.clone(),
        )
        .await
        .expect("start");

        // No yield between `start` and the checks: the listener task has not run yet.
        assert_eq!(stats.state(), ListenerState::Listening);
        let snapshot = service.pipeline().snapshot();
        assert_eq!(snapshot.state, ListenerState::Listening);
        assert!(snapshot.running);

        service.shutdown().await.expect("clean shutdown");
        assert!(!stats.snapshot(0).running);
    }

    #[tokio::test]
    async fn socket_failure_still_flushes_before_stopped() {
        let stats = Arc::new(IngestStats::new());
        let sink = Arc::new(StateAtWriteSink {
            stats: stats.clone(),
            writes: Mutex::new(Vec::new()),
        });
        let (pipeline, scheduler) = spawn_scheduler(
            sink.clone(),
            stats.clone(),
            FlushSettings {
                max_size: 100,
                flush_interval: Duration::from_secs(3600),
                check_interval: Duration::from_secs(3600),
                sink_timeout: Duration::from_secs(5),
            },
        );
        stats.set_state(ListenerState::Listening);
        for seq in 0..3 {
            pipeline.ingest(test_sample(seq));
        }

        let failed_listener = async {
            Err(ServiceError::Socket(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )))
        };
        let result = supervise(failed_listener, pipeline.clone(), scheduler).await;

        assert!(matches!(result, Err(ServiceError::Socket(_))));
        assert_eq!(stats.state(), ListenerState::Stopped);
        assert_eq!(pipeline.buffer_len(), 0);
        assert_eq!(
            *sink.writes.lock().expect("writes lock"),
            vec![(ListenerState::Stopping, 3)]
        );
    }
}
