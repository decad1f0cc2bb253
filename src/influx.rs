//! InfluxDB v2 writer.
//!
//! Batches are rendered as line protocol,
//! `measurement,tag=value field=value,... timestamp_ms`, and posted to
//! `/api/v2/write` in a single request.

use crate::config::Config;
use crate::sink::{PointTags, SampleSink, SinkError};
use crate::telemetry::Sample;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::fmt::Write as _;

const MAX_ERROR_BODY: usize = 512;

pub struct InfluxSink {
    client: Client,
    write_url: String,
    org: String,
    bucket: String,
    token: Option<String>,
    tags: PointTags,
}

impl InfluxSink {
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(config.influx_timeout())
            .build()
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.influx_url.trim_end_matches('/')),
            org: config.influx_org.clone(),
            bucket: config.influx_bucket.clone(),
            token: config.influx_token.clone(),
            tags: config.point_tags(),
        })
    }
}

impl SampleSink for InfluxSink {
    async fn write_batch(&self, batch: &[Sample]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = render_batch(&self.tags, batch);

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = self.token.as_deref() {
            request = request.header(AUTHORIZATION, format!("Token {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            tracing::trace!(points = batch.len(), %status, "influx write accepted");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

pub fn render_batch(tags: &PointTags, batch: &[Sample]) -> String {
    let mut body = String::with_capacity(batch.len() * 320);
    for (idx, sample) in batch.iter().enumerate() {
        if idx > 0 {
            body.push('\n');
        }
        render_point(&mut body, tags, sample);
    }
    body
}

fn render_point(out: &mut String, tags: &PointTags, sample: &Sample) {
    out.push_str(&escape_measurement(&tags.measurement));
    // Tag keys are already in sorted order.
    out.push_str(",data_source=");
    out.push_str(&escape_tag(&tags.data_source));
    out.push_str(",grid_section=");
    out.push_str(&escape_tag(&tags.grid_section));
    out.push(' ');

    for (name, value) in sample.float_fields() {
        // Line protocol has no spelling for NaN or infinity.
        if !value.is_finite() {
            continue;
        }
        let _ = write!(out, "{name}={value},");
    }
    let _ = write!(
        out,
        "fault_indicator={}i {}",
        sample.fault_indicator,
        sample.timestamp.timestamp_millis()
    );
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
