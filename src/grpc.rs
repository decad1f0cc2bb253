use crate::pipeline::{FlushOutcome, PipelineHandle, StatsSnapshot};
use anyhow::Result;
use std::path::Path;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("grid.ingest");
}

use proto::grid_ingest_server::{GridIngest, GridIngestServer};
use proto::{FlushResponse, HealthRequest, HealthResponse};

#[derive(Clone)]
pub struct ControlService {
    pipeline: PipelineHandle,
}

impl ControlService {
    pub fn new(pipeline: PipelineHandle) -> Self {
        Self { pipeline }
    }

    fn to_health(snapshot: StatsSnapshot) -> HealthResponse {
        HealthResponse {
            state: snapshot.state.as_str().to_string(),
            running: snapshot.running,
            buffer_len: snapshot.buffer_len,
            last_flush_unix_ms: snapshot.last_flush_unix_ms,
            packets_received: snapshot.packets_received,
            samples_received: snapshot.samples_received,
            decode_failures: snapshot.decode_failures,
            socket_errors: snapshot.socket_errors,
            samples_flushed: snapshot.samples_flushed,
            samples_lost: snapshot.samples_lost,
            flush_failures: snapshot.flush_failures,
            last_batch_len: snapshot.last_batch_len,
            average_flush_ms: snapshot.average_flush_ms,
            last_error: snapshot.last_error.unwrap_or_default(),
            build: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[tonic::async_trait]
impl GridIngest for ControlService {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(Self::to_health(self.pipeline.snapshot())))
    }

    async fn flush(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<FlushResponse>, Status> {
        let outcome = self
            .pipeline
            .flush()
            .await
            .map_err(|err| Status::unavailable(err.to_string()))?;
        let (outcome, samples, error) = match outcome {
            FlushOutcome::Empty => ("empty", 0, String::new()),
            FlushOutcome::Written { samples } => ("written", samples as u64, String::new()),
            FlushOutcome::Failed { lost, error } => ("failed", lost as u64, error),
        };
        Ok(Response::new(FlushResponse {
            outcome: outcome.to_string(),
            samples,
            error,
            health: Some(Self::to_health(self.pipeline.snapshot())),
        }))
    }
}

pub async fn serve_uds(socket_path: &str, service: ControlService) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<GridIngestServer<ControlService>>()
        .await;
    tracing::info!(path = socket_path, "control plane listening");

    let incoming = UnixListenerStream::new(uds);

    Server::builder()
        .add_service(health_service)
        .add_service(GridIngestServer::new(service))
        .serve_with_incoming(incoming)
        .await?;

    Ok(())
}
