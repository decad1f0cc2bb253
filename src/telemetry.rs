use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Number of little-endian `f64` words in a binary datagram.
pub const BINARY_FIELD_COUNT: usize = 11;
pub const BINARY_PAYLOAD_LEN: usize = BINARY_FIELD_COUNT * 8;

/// One decoded grid measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub bus_voltage: f64,
    pub bus_frequency: f64,
    pub active_power: f64,
    pub reactive_power: f64,
    pub current_magnitude: f64,
    pub current_phase: f64,
    pub temperature: f64,
    pub load_demand: f64,
    pub generation_output: f64,
    pub grid_stability_index: f64,
    /// Always 0 or 1.
    pub fault_indicator: u8,
}

impl Sample {
    /// Float fields in wire order, paired with their store field names.
    pub fn float_fields(&self) -> [(&'static str, f64); BINARY_FIELD_COUNT - 1] {
        [
            ("bus_voltage", self.bus_voltage),
            ("bus_frequency", self.bus_frequency),
            ("active_power", self.active_power),
            ("reactive_power", self.reactive_power),
            ("current_magnitude", self.current_magnitude),
            ("current_phase", self.current_phase),
            ("temperature", self.temperature),
            ("load_demand", self.load_demand),
            ("generation_output", self.generation_output),
            ("grid_stability_index", self.grid_stability_index),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("datagram exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("JSON payload is not an object")]
    NotObject,
    #[error("field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl DecodeError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Datagram encoding, selected once from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Binary => "binary",
            WireFormat::Json => "json",
        }
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Sample, DecodeError> {
        self.decode_at(raw, Utc::now())
    }

    /// Decodes with `received_at` standing in for payloads that carry no timestamp.
    pub fn decode_at(&self, raw: &[u8], received_at: DateTime<Utc>) -> Result<Sample, DecodeError> {
        match self {
            WireFormat::Binary => decode_binary(raw, received_at),
            WireFormat::Json => decode_json(raw, received_at),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(WireFormat::Binary),
            "json" => Ok(WireFormat::Json),
            other => Err(format!("unknown data format {other:?} (expected binary or json)")),
        }
    }
}

fn decode_binary(raw: &[u8], received_at: DateTime<Utc>) -> Result<Sample, DecodeError> {
    if raw.len() != BINARY_PAYLOAD_LEN {
        return Err(DecodeError::LengthMismatch {
            expected: BINARY_PAYLOAD_LEN,
            actual: raw.len(),
        });
    }

    let mut values = [0f64; BINARY_FIELD_COUNT];
    for (slot, chunk) in values.iter_mut().zip(raw.chunks_exact(8)) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        *slot = f64::from_le_bytes(word);
    }

    Ok(Sample {
        timestamp: received_at,
        bus_voltage: values[0],
        bus_frequency: values[1],
        active_power: values[2],
        reactive_power: values[3],
        current_magnitude: values[4],
        current_phase: values[5],
        temperature: values[6],
        load_demand: values[7],
        generation_output: values[8],
        grid_stability_index: values[9],
        fault_indicator: fault_flag(values[10])?,
    })
}

fn fault_flag(value: f64) -> Result<u8, DecodeError> {
    if !value.is_finite() {
        return Err(DecodeError::invalid("fault_indicator", "not a finite number"));
    }
    match value.trunc() {
        v if v == 0.0 => Ok(0),
        v if v == 1.0 => Ok(1),
        v => Err(DecodeError::invalid(
            "fault_indicator",
            format!("{v} is outside {{0, 1}}"),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct WireSample {
    #[serde(default)]
    timestamp: Option<WireValue>,
    #[serde(default)]
    bus_voltage: Option<WireValue>,
    #[serde(default)]
    bus_frequency: Option<WireValue>,
    #[serde(default)]
    active_power: Option<WireValue>,
    #[serde(default)]
    reactive_power: Option<WireValue>,
    #[serde(default)]
    current_magnitude: Option<WireValue>,
    #[serde(default)]
    current_phase: Option<WireValue>,
    #[serde(default)]
    temperature: Option<WireValue>,
    #[serde(default)]
    load_demand: Option<WireValue>,
    #[serde(default)]
    generation_output: Option<WireValue>,
    #[serde(default)]
    grid_stability_index: Option<WireValue>,
    #[serde(default)]
    fault_indicator: Option<WireValue>,
}

// Anything the untagged arms above `Other` reject still deserializes, so type
// problems surface from `coerce_f64` with the field name attached.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Number(f64),
    Flag(bool),
    Text(String),
    Other(IgnoredAny),
}

fn coerce_f64(field: &'static str, value: Option<WireValue>, default: f64) -> Result<f64, DecodeError> {
    match value {
        None => Ok(default),
        Some(WireValue::Number(v)) => Ok(v),
        Some(WireValue::Flag(flag)) => Ok(if flag { 1.0 } else { 0.0 }),
        Some(WireValue::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| DecodeError::invalid(field, format!("{text:?} is not a number"))),
        Some(WireValue::Other(_)) => Err(DecodeError::invalid(field, "expected a number")),
    }
}

fn coerce_timestamp(value: Option<WireValue>, received_at: DateTime<Utc>) -> Result<DateTime<Utc>, DecodeError> {
    match value {
        None => Ok(received_at),
        Some(WireValue::Text(raw)) => parse_timestamp(&raw)
            .ok_or_else(|| DecodeError::invalid("timestamp", format!("{raw:?} is not an ISO-8601 date-time"))),
        Some(_) => Err(DecodeError::invalid("timestamp", "expected an ISO-8601 string")),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Compact `+hhmm` offsets.
    let offset = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"]
        .iter()
        .find_map(|format| DateTime::parse_from_str(trimmed, format).ok());
    if let Some(parsed) = offset {
        return Some(parsed.with_timezone(&Utc));
    }
    // Senders that emit naive local datetimes are taken as UTC.
    let naive = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ]
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
    .or_else(|| {
        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    });
    naive.map(|naive| naive.and_utc())
}

fn decode_json(raw: &[u8], received_at: DateTime<Utc>) -> Result<Sample, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    if !text.trim_start().starts_with('{') {
        return Err(match serde_json::from_str::<IgnoredAny>(text) {
            Ok(_) => DecodeError::NotObject,
            Err(err) => DecodeError::Malformed(err.to_string()),
        });
    }
    let mut payload = raw.to_vec();
    let wire: WireSample = simd_json::serde::from_slice(&mut payload)
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;

    let fault = coerce_f64("fault_indicator", wire.fault_indicator, 0.0)?;

    Ok(Sample {
        timestamp: coerce_timestamp(wire.timestamp, received_at)?,
        bus_voltage: coerce_f64("bus_voltage", wire.bus_voltage, 0.0)?,
        bus_frequency: coerce_f64("bus_frequency", wire.bus_frequency, 50.0)?,
        active_power: coerce_f64("active_power", wire.active_power, 0.0)?,
        reactive_power: coerce_f64("reactive_power", wire.reactive_power, 0.0)?,
        current_magnitude: coerce_f64("current_magnitude", wire.current_magnitude, 0.0)?,
        current_phase: coerce_f64("current_phase", wire.current_phase, 0.0)?,
        temperature: coerce_f64("temperature", wire.temperature, 25.0)?,
        load_demand: coerce_f64("load_demand", wire.load_demand, 0.0)?,
        generation_output: coerce_f64("generation_output", wire.generation_output, 0.0)?,
        grid_stability_index: coerce_f64("grid_stability_index", wire.grid_stability_index, 1.0)?,
        fault_indicator: fault_flag(fault)?,
    })
}

#[cfg(test)]
pub(crate) fn encode_binary(sample: &Sample) -> [u8; BINARY_PAYLOAD_LEN] {
    let mut out = [0u8; BINARY_PAYLOAD_LEN];
    let words = sample
        .float_fields()
        .map(|(_, value)| value)
        .into_iter()
        .chain(std::iter::once(f64::from(sample.fault_indicator)));
    for (chunk, value) in out.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    out
}

/// Sample whose `bus_voltage` carries `seq`, for ordering assertions.
#[cfg(test)]
pub(crate) fn test_sample(seq: u32) -> Sample {
    Sample {
        timestamp: Utc::now(),
        bus_voltage: f64::from(seq),
        bus_frequency: 50.0,
        active_power: 10_000.0,
        reactive_power: 3_000.0,
        current_magnitude: 1.25,
        current_phase: 0.0,
        temperature: 25.0,
        load_demand: 7_000.0,
        generation_output: 7_350.0,
        grid_stability_index: 1.0,
        fault_indicator: 0,
    }
}
