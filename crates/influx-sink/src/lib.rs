#![allow(dead_code)]

use std::time::Duration;

use thiserror::Error;
use tracing::info;

use types::{MetricValue, Point};

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL of the InfluxDB v1 instance, e.g. `http://192.168.1.70:8086`.
    pub url: String,
    pub database: String,
    /// Timestamp precision reported on the write endpoint.
    pub precision: String,
    pub timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            database: "mydb".to_string(),
            precision: "ms".to_string(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("line protocol encode error: {0}")]
    Encode(String),
    #[error("influx client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("influx write rejected with status {status}")]
    Status { status: u16 },
}

/// Writes points to InfluxDB, or logs them when constructed in mock mode.
#[derive(Debug, Clone)]
pub struct InfluxWriter {
    config: InfluxConfig,
    http: Option<reqwest::Client>,
}

impl InfluxWriter {
    pub fn new_mock(database: impl Into<String>) -> Self {
        let mut config = InfluxConfig::default();
        config.database = database.into();
        Self { config, http: None }
    }

    pub fn new_http(config: InfluxConfig) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            config,
            http: Some(http),
        })
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub async fn write_point(&self, point: &Point) -> Result<(), PublishError> {
        let line = to_line_protocol(point)?;
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), PublishError> {
        match &self.http {
            Some(client) => {
                let url = format!("{}/write", self.config.url.trim_end_matches('/'));
                let response = client
                    .post(&url)
                    .query(&[
                        ("db", self.config.database.as_str()),
                        ("precision", self.config.precision.as_str()),
                    ])
                    .body(line.to_string())
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(PublishError::Status {
                        status: response.status().as_u16(),
                    });
                }
                Ok(())
            }
            None => {
                info!(database = %self.config.database, line = %line, "mock influx write");
                Ok(())
            }
        }
    }
}

/// Renders one point as an InfluxDB line protocol record.
///
/// `measurement,tag=value field="value" 1700000000000`
pub fn to_line_protocol(point: &Point) -> Result<String, PublishError> {
    if point.measurement.is_empty() {
        return Err(PublishError::Encode("empty measurement name".to_string()));
    }
    if point.fields.is_empty() {
        return Err(PublishError::Encode(format!(
            "point {} has no fields",
            point.measurement
        )));
    }

    let mut line = escape_key(&point.measurement);
    for (key, value) in &point.tags {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    for (idx, (key, value)) in point.fields.iter().enumerate() {
        if idx > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&field_value(value));
    }

    if let Some(timestamp_ms) = point.timestamp_ms {
        line.push(' ');
        line.push_str(&timestamp_ms.to_string());
    }

    Ok(line)
}

fn escape_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == ',' || ch == '=' || ch == ' ' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn field_value(value: &MetricValue) -> String {
    match value {
        MetricValue::Float(number) => format!("{number}"),
        MetricValue::Text(text) => {
            let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{escaped}\"")
        }
    }
}
