mod buffer;
mod config;
mod grpc;
mod influx;
mod pipeline;
mod service;
mod sink;
mod telemetry;
mod udp;

use crate::config::Config;
use crate::grpc::{serve_uds, ControlService};
use crate::influx::InfluxSink;
use crate::pipeline::IngestStats;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_directive().into());

    let (stdout_layer, file_layer) = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (None, Some(layer))
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), None)
        }
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let endpoint = normalize_otlp_http_endpoint(endpoint);
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "grid-udp-ingest"),
                ])))
                .install_batch(Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, file_warning) = Config::load()?;
    init_tracing(&config)?;
    if let Some(warning) = file_warning {
        tracing::warn!(%warning, "config file ignored; using env settings");
    }
    tracing::info!(config = %config.summary(), "starting grid udp ingest");

    let sink = Arc::new(InfluxSink::new(&config).context("failed to build InfluxDB client")?);
    let stats = Arc::new(IngestStats::new());
    let mut running = service::start(&config, sink, stats).await?;

    let grpc_handle = config.grpc_socket_path.clone().map(|path| {
        let control = ControlService::new(running.pipeline());
        tokio::spawn(async move {
            if let Err(err) = serve_uds(&path, control).await {
                tracing::error!(error=%err, path, "control plane exited");
            }
        })
    });

    let finished = tokio::select! {
        res = running.wait() => Some(res),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            None
        }
    };
    let result = match finished {
        Some(res) => res,
        None => running.shutdown().await,
    };

    if let Some(handle) = grpc_handle {
        handle.abort();
    }
    if let Some(path) = &config.grpc_socket_path {
        tokio::fs::remove_file(path).await.ok();
    }
    if config.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result.context("grid listener failed")?;
    Ok(())
}
