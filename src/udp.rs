use crate::pipeline::{IngestStats, ListenerState, PipelineHandle};
use crate::service::ServiceError;
use crate::telemetry::{DecodeError, WireFormat};
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

const MAX_CONSECUTIVE_ERRORS: u32 = 64;
const PACKET_LOG_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub format: WireFormat,
    pub recv_timeout: Duration,
    pub max_datagram: usize,
}

/// Receives datagrams until `shutdown` flips or the socket fails for good.
///
/// Holds the `Listening` state while it runs; the caller owns the transitions
/// around it.
pub async fn run_listener(
    socket: UdpSocket,
    settings: ListenerSettings,
    pipeline: PipelineHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServiceError> {
    let stats = pipeline.stats();
    stats.set_state(ListenerState::Listening);
    if let Ok(addr) = socket.local_addr() {
        tracing::info!(%addr, format = settings.format.as_str(), "listening for grid telemetry");
    }

    // One spare byte tells an oversized datagram apart from one that fits exactly.
    let mut buf = vec![0u8; settings.max_datagram + 1];
    let mut consecutive_errors = 0u32;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                continue;
            }
            received = tokio::time::timeout(settings.recv_timeout, socket.recv_from(&mut buf)) => received,
        };

        let (len, peer) = match received {
            Err(_) => continue,
            Ok(Ok(datagram)) => datagram,
            Ok(Err(err)) => {
                record_recv_error(&stats, err, &mut consecutive_errors)?;
                continue;
            }
        };
        consecutive_errors = 0;

        let packets = stats.packets_received.fetch_add(1, Ordering::Relaxed) + 1;
        let decoded = if len > settings.max_datagram {
            Err(DecodeError::Oversized {
                limit: settings.max_datagram,
            })
        } else {
            settings.format.decode(&buf[..len])
        };
        match decoded {
            Ok(sample) => pipeline.ingest(sample),
            Err(err) => {
                stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%peer, len, error = %err, "dropping undecodable datagram");
            }
        }

        if packets % PACKET_LOG_EVERY == 0 {
            tracing::info!(
                packets,
                %peer,
                buffered = pipeline.buffer_len(),
                "received grid packets"
            );
        }
    }
}

/// Counts a failed receive. Returns `ServiceError::Socket` once the socket
/// cannot be trusted any more.
fn record_recv_error(
    stats: &IngestStats,
    err: io::Error,
    consecutive_errors: &mut u32,
) -> Result<(), ServiceError> {
    *consecutive_errors += 1;
    stats.socket_errors.fetch_add(1, Ordering::Relaxed);
    stats.record_error(format!("udp receive: {err}"));
    if !is_transient(&err) || *consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
        tracing::error!(error = %err, consecutive_errors = *consecutive_errors, "udp socket failed");
        return Err(ServiceError::Socket(err));
    }
    tracing::warn!(error = %err, consecutive_errors = *consecutive_errors, "udp receive error");
    Ok(())
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{spawn_scheduler, FlushOutcome, FlushSettings};
    use crate::sink::testing::RecordingSink;
    use crate::telemetry::{encode_binary, test_sample, BINARY_PAYLOAD_LEN};
    use std::sync::Arc;

    struct Harness {
        sink: Arc<RecordingSink>,
        pipeline: PipelineHandle,
        sender: UdpSocket,
        shutdown: watch::Sender<bool>,
        listener: tokio::task::JoinHandle<Result<(), ServiceError>>,
    }

    async fn harness(format: WireFormat, max_datagram: usize) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, _scheduler) = spawn_scheduler(
            sink.clone(),
            Arc::new(IngestStats::new()),
            FlushSettings {
                max_size: 1000,
                flush_interval: Duration::from_secs(3600),
                check_interval: Duration::from_secs(3600),
                sink_timeout: Duration::from_secs(5),
            },
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind listener");
        let target = socket.local_addr().expect("listener addr");
        let sender = UdpSocket::bind("127.0.0.1:0").await.expect("bind sender");
        sender.connect(target).await.expect("connect sender");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(run_listener(
            socket,
            ListenerSettings {
                format,
                recv_timeout: Duration::from_millis(20),
                max_datagram,
            },
            pipeline.clone(),
            shutdown_rx,
        ));
        Harness {
            sink,
            pipeline,
            sender,
            shutdown,
            listener,
        }
    }

    async fn wait_for_packets(pipeline: &PipelineHandle, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.snapshot().packets_received < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("datagrams arrive");
    }

    #[tokio::test]
    async fn decode_failure_does_not_block_later_datagrams() {
        let h = harness(WireFormat::Binary, 1024).await;

        h.sender.send(&[1, 2, 3]).await.expect("send short");
        h.sender
            .send(&encode_binary(&test_sample(11)))
            .await
            .expect("send valid");
        wait_for_packets(&h.pipeline, 2).await;

        let snapshot = h.pipeline.snapshot();
        assert_eq!(snapshot.state, ListenerState::Listening);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.samples_received, 1);
        assert_eq!(
            h.pipeline.flush().await.expect("flush"),
            FlushOutcome::Written { samples: 1 }
        );
        assert_eq!(h.sink.batches()[0][0].bus_voltage, 11.0);

        h.shutdown.send(true).expect("signal");
        h.listener.await.expect("listener task").expect("clean exit");
    }

    #[tokio::test]
    async fn json_datagrams_are_decoded() {
        let h = harness(WireFormat::Json, 1024).await;

        h.sender
            .send(br#"{"bus_voltage": 13800.5, "fault_indicator": true, "extra": "x"}"#)
            .await
            .expect("send json");
        h.sender.send(b"{not json").await.expect("send garbage");
        wait_for_packets(&h.pipeline, 2).await;

        h.pipeline.flush().await.expect("flush");
        let batches = h.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].bus_voltage, 13800.5);
        assert_eq!(batches[0][0].bus_frequency, 50.0);
        assert_eq!(batches[0][0].fault_indicator, 1);
        assert_eq!(h.pipeline.snapshot().decode_failures, 1);

        h.shutdown.send(true).expect("signal");
        h.listener.await.expect("listener task").expect("clean exit");
    }

    #[tokio::test]
    async fn oversized_datagram_is_counted_as_a_decode_failure() {
        let h = harness(WireFormat::Binary, BINARY_PAYLOAD_LEN).await;

        h.sender
            .send(&[0u8; BINARY_PAYLOAD_LEN + 8])
            .await
            .expect("send oversized");
        h.sender
            .send(&encode_binary(&test_sample(3)))
            .await
            .expect("send exact");
        wait_for_packets(&h.pipeline, 2).await;

        let snapshot = h.pipeline.snapshot();
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.samples_received, 1);

        h.shutdown.send(true).expect("signal");
        h.listener.await.expect("listener task").expect("clean exit");
    }

    #[tokio::test]
    async fn stops_when_the_shutdown_sender_is_dropped() {
        let h = harness(WireFormat::Binary, 1024).await;
        drop(h.shutdown);
        tokio::time::timeout(Duration::from_secs(1), h.listener)
            .await
            .expect("listener exits")
            .expect("listener task")
            .expect("clean exit");
    }

    #[test]
    fn non_transient_receive_error_stops_the_listener() {
        let stats = IngestStats::new();
        let mut consecutive = 0;
        let err = record_recv_error(
            &stats,
            io::Error::from(io::ErrorKind::PermissionDenied),
            &mut consecutive,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::Socket(ref e) if e.kind() == io::ErrorKind::PermissionDenied));
        assert_eq!(stats.socket_errors.load(Ordering::Relaxed), 1);
        assert!(stats.snapshot(0).last_error.is_some());
    }

    #[test]
    fn repeated_transient_errors_eventually_stop_the_listener() {
        let stats = IngestStats::new();
        let mut consecutive = 0;
        for _ in 1..MAX_CONSECUTIVE_ERRORS {
            record_recv_error(
                &stats,
                io::Error::from(io::ErrorKind::ConnectionReset),
                &mut consecutive,
            )
            .expect("transient error tolerated");
        }
        let err = record_recv_error(
            &stats,
            io::Error::from(io::ErrorKind::ConnectionReset),
            &mut consecutive,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::Socket(_)));
        assert_eq!(
            stats.socket_errors.load(Ordering::Relaxed),
            u64::from(MAX_CONSECUTIVE_ERRORS)
        );
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::other("socket gone")));
    }
}
