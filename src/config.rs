use crate::sink::PointTags;
use crate::telemetry::{WireFormat, BINARY_PAYLOAD_LEN};
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_GRPC_SOCKET: &str = "/tmp/grid_ingest.sock";

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub udp_host: String,
    pub udp_port: u32,
    pub udp_buffer_size: usize,
    pub udp_timeout_secs: f64,
    pub data_format: WireFormat,
    pub influx_url: String,
    pub influx_token: Option<String>,
    pub influx_org: String,
    pub influx_bucket: String,
    pub influx_timeout_ms: u64,
    pub buffer_max_size: usize,
    pub flush_interval_secs: f64,
    /// Reserved for sink-level retry; the batching core never retries.
    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub flush_check_interval_ms: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub measurement_name: String,
    pub data_source_tag: String,
    pub grid_section_tag: String,
    pub grpc_socket_path: Option<String>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Reads `.env`, the environment and the optional JSON file named by
    /// `GRID_CONFIG_PATH`, then validates the result.
    ///
    /// Runs before logging exists, so a config file that had to be skipped is
    /// handed back as a warning for the caller to log.
    pub fn load() -> Result<(Self, Option<String>)> {
        dotenv().ok();

        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        let warning = config_file_path(|key| env::var(key).ok())
            .and_then(|path| config.apply_config_path(&path));
        config.validate()?;
        Ok((config, warning))
    }

    /// Applies the JSON file at `path`. On failure the config is left as is
    /// and the reason is returned.
    fn apply_config_path(&mut self, path: &Path) -> Option<String> {
        match load_config_file(path) {
            Ok(file) => {
                self.apply_file(file);
                None
            }
            Err(warning) => Some(warning),
        }
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let udp_host = env_string(&lookup, "UDP_HOST", "localhost");
        let udp_port = env_parse(&lookup, "UDP_PORT", 12345u32)?;
        let udp_buffer_size = env_parse(&lookup, "UDP_BUFFER_SIZE", 1024usize)?;
        let udp_timeout_secs = env_parse(&lookup, "UDP_TIMEOUT", 1.0f64)?;
        let data_format = match env_optional(&lookup, "DATA_FORMAT") {
            Some(raw) => WireFormat::from_str(&raw).map_err(|err| anyhow!("invalid DATA_FORMAT: {err}"))?,
            None => WireFormat::Binary,
        };

        let influx_url = env_string(&lookup, "INFLUX_URL", "http://localhost:8086");
        let influx_token = env_optional(&lookup, "INFLUX_TOKEN");
        let influx_org = env_string(&lookup, "INFLUX_ORG", "smartgrid-org");
        let influx_bucket = env_string(&lookup, "INFLUX_BUCKET", "grid-data");
        let influx_timeout_ms = env_parse(&lookup, "INFLUX_TIMEOUT", 10_000u64)?;

        let buffer_max_size = env_parse(&lookup, "BUFFER_MAX_SIZE", 100usize)?;
        let flush_interval_secs = env_parse(&lookup, "BUFFER_FLUSH_INTERVAL", 1.0f64)?;
        let retry_attempts = env_parse(&lookup, "BUFFER_RETRY_ATTEMPTS", 3u32)?;
        let retry_delay_secs = env_parse(&lookup, "BUFFER_RETRY_DELAY", 1.0f64)?;
        let flush_check_interval_ms = env_parse(&lookup, "FLUSH_CHECK_INTERVAL_MS", 100u64)?;

        let log_level = env_string(&lookup, "LOG_LEVEL", "INFO");
        let log_file = env_optional(&lookup, "LOG_FILE").map(PathBuf::from);

        let measurement_name = env_string(&lookup, "GRID_MEASUREMENT_NAME", "grid_measurements");
        let data_source_tag = env_string(&lookup, "GRID_DATA_SOURCE_TAG", "simulink");
        let grid_section_tag = env_string(&lookup, "GRID_SECTION_TAG", "main_bus");

        // An explicitly empty GRID_GRPC_SOCKET turns the control plane off.
        let grpc_socket_path = match lookup("GRID_GRPC_SOCKET") {
            Some(raw) => Some(raw.trim().to_string()).filter(|path| !path.is_empty()),
            None => Some(DEFAULT_GRPC_SOCKET.to_string()),
        };
        let otlp_endpoint = env_optional(&lookup, "OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            udp_host,
            udp_port,
            udp_buffer_size,
            udp_timeout_secs,
            data_format,
            influx_url,
            influx_token,
            influx_org,
            influx_bucket,
            influx_timeout_ms,
            buffer_max_size,
            flush_interval_secs,
            retry_attempts,
            retry_delay_secs,
            flush_check_interval_ms,
            log_level,
            log_file,
            measurement_name,
            data_source_tag,
            grid_section_tag,
            grpc_socket_path,
            otlp_endpoint,
        })
    }

    fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            udp,
            influx,
            buffer,
            logging,
            grid,
        } = file;

        if let Some(host) = non_empty(udp.host) {
            self.udp_host = host;
        }
        if let Some(port) = udp.port {
            self.udp_port = port;
        }
        if let Some(size) = udp.buffer_size {
            self.udp_buffer_size = size;
        }
        if let Some(timeout) = udp.timeout {
            self.udp_timeout_secs = timeout;
        }
        if let Some(format) = udp.format {
            self.data_format = format;
        }

        if let Some(url) = influx.url {
            self.influx_url = url.trim().to_string();
        }
        if let Some(token) = influx.token {
            self.influx_token = non_empty(Some(token));
        }
        if let Some(org) = influx.org {
            self.influx_org = org.trim().to_string();
        }
        if let Some(bucket) = influx.bucket {
            self.influx_bucket = bucket.trim().to_string();
        }
        if let Some(timeout) = influx.timeout {
            self.influx_timeout_ms = timeout;
        }

        if let Some(max_size) = buffer.max_size {
            self.buffer_max_size = max_size;
        }
        if let Some(interval) = buffer.flush_interval {
            self.flush_interval_secs = interval;
        }
        if let Some(attempts) = buffer.retry_attempts {
            self.retry_attempts = attempts;
        }
        if let Some(delay) = buffer.retry_delay {
            self.retry_delay_secs = delay;
        }
        if let Some(check) = buffer.check_interval_ms {
            self.flush_check_interval_ms = check;
        }

        if let Some(level) = non_empty(logging.level) {
            self.log_level = level;
        }
        if let Some(file) = logging.file {
            self.log_file = non_empty(Some(file)).map(PathBuf::from);
        }

        if let Some(name) = non_empty(grid.measurement_name) {
            self.measurement_name = name;
        }
        if let Some(tag) = non_empty(grid.data_source_tag) {
            self.data_source_tag = tag;
        }
        if let Some(tag) = non_empty(grid.grid_section_tag) {
            self.grid_section_tag = tag;
        }
    }

    /// Reports every problem at once rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.udp_host.trim().is_empty() {
            problems.push("UDP host is required".to_string());
        }
        if !(1..=65535).contains(&self.udp_port) {
            problems.push(format!("invalid UDP port: {}", self.udp_port));
        }
        if !positive(self.udp_timeout_secs) {
            problems.push(format!("invalid UDP timeout: {}", self.udp_timeout_secs));
        }
        if self.udp_buffer_size < BINARY_PAYLOAD_LEN {
            problems.push(format!(
                "UDP buffer size {} is smaller than a {BINARY_PAYLOAD_LEN}-byte datagram",
                self.udp_buffer_size
            ));
        }

        if self.influx_url.trim().is_empty() {
            problems.push("InfluxDB URL is required".to_string());
        }
        if self.influx_org.trim().is_empty() {
            problems.push("InfluxDB organization is required".to_string());
        }
        if self.influx_bucket.trim().is_empty() {
            problems.push("InfluxDB bucket is required".to_string());
        }
        if self.influx_timeout_ms == 0 {
            problems.push("InfluxDB timeout must be positive".to_string());
        }

        if self.buffer_max_size == 0 {
            problems.push(format!("invalid buffer max size: {}", self.buffer_max_size));
        }
        if !positive(self.flush_interval_secs) {
            problems.push(format!(
                "invalid buffer flush interval: {}",
                self.flush_interval_secs
            ));
        }
        if !(self.retry_delay_secs.is_finite() && self.retry_delay_secs >= 0.0) {
            problems.push(format!("invalid retry delay: {}", self.retry_delay_secs));
        }
        if self.flush_check_interval_ms == 0 {
            problems.push("flush check interval must be positive".to_string());
        }

        if log_level_directive(&self.log_level).is_none() {
            problems.push(format!("unknown log level: {}", self.log_level));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.udp_host, self.udp_port)
    }

    pub fn recv_timeout(&self) -> Duration {
        secs(self.udp_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        secs(self.flush_interval_secs)
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }

    pub fn influx_timeout(&self) -> Duration {
        Duration::from_millis(self.influx_timeout_ms)
    }

    pub fn point_tags(&self) -> PointTags {
        PointTags {
            measurement: self.measurement_name.clone(),
            data_source: self.data_source_tag.clone(),
            grid_section: self.grid_section_tag.clone(),
        }
    }

    /// Default filter directive derived from `LOG_LEVEL`.
    pub fn log_directive(&self) -> String {
        let level = log_level_directive(&self.log_level).unwrap_or("info");
        format!("{level},grid_udp_ingest={level}")
    }

    /// Effective settings for the startup log. The token is left out.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "udp": {
                "host": self.udp_host,
                "port": self.udp_port,
                "buffer_size": self.udp_buffer_size,
                "timeout": self.udp_timeout_secs,
                "format": self.data_format.as_str(),
            },
            "influx": {
                "url": self.influx_url,
                "org": self.influx_org,
                "bucket": self.influx_bucket,
                "timeout": self.influx_timeout_ms,
            },
            "buffer": {
                "max_size": self.buffer_max_size,
                "flush_interval": self.flush_interval_secs,
                "retry_attempts": self.retry_attempts,
                "retry_delay": self.retry_delay_secs,
                "check_interval_ms": self.flush_check_interval_ms,
            },
            "logging": {
                "level": self.log_level,
                "file": self.log_file.as_ref().map(|path| path.display().to_string()),
            },
            "grid": {
                "measurement_name": self.measurement_name,
                "data_source_tag": self.data_source_tag,
                "grid_section_tag": self.grid_section_tag,
            },
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    udp: UdpSection,
    #[serde(default)]
    influx: InfluxSection,
    #[serde(default)]
    buffer: BufferSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    grid: GridSection,
}

#[derive(Debug, Default, Deserialize)]
struct UdpSection {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u32>,
    #[serde(default)]
    buffer_size: Option<usize>,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_format")]
    format: Option<WireFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct InfluxSection {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BufferSection {
    #[serde(default)]
    max_size: Option<usize>,
    #[serde(default)]
    flush_interval: Option<f64>,
    #[serde(default)]
    retry_attempts: Option<u32>,
    #[serde(default)]
    retry_delay: Option<f64>,
    #[serde(default)]
    check_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GridSection {
    #[serde(default)]
    measurement_name: Option<String>,
    #[serde(default)]
    data_source_tag: Option<String>,
    #[serde(default)]
    grid_section_tag: Option<String>,
}

fn deserialize_format<'de, D>(deserializer: D) -> Result<Option<WireFormat>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|value| WireFormat::from_str(&value).map_err(serde::de::Error::custom))
        .transpose()
}

fn config_file_path(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    lookup("GRID_CONFIG_PATH")
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

fn load_config_file(path: &Path) -> Result<FileConfig, String> {
    if !path.exists() {
        return Err(format!("config file {} not found", path.display()));
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read config file {}: {err}", path.display()))?;
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
        .map_err(|err| format!("failed to parse config file {}: {err}", path.display()))
}

fn log_level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" => Some("error"),
        _ => None,
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    non_empty(lookup(key))
}

fn env_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    env_optional(lookup, key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_optional(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
