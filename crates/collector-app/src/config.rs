use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use acquisition::SupervisorConfig;
use influx_sink::InfluxConfig;
use registry::{LineConfig, RegistryConfig};

const DEFAULT_RESPAWN_DELAY_MS: u64 = 1_000;
const DEFAULT_INFLUX_DATABASE: &str = "mydb";
const DEFAULT_INFLUX_PRECISION: &str = "ms";
const DEFAULT_INFLUX_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub registry: RegistryConfig,
    pub poller: SupervisorConfig,
    /// Delay before the acquisition loop is respawned after a fault.
    pub respawn_delay_ms: u64,
    /// Absent means the mock writer, which logs instead of posting.
    pub influx: Option<InfluxConfig>,
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.lines.is_empty() {
            anyhow::bail!("lines must list at least one serial port");
        }
        for line in &self.registry.lines {
            if line.port.trim().is_empty() {
                anyhow::bail!("lines.port must be non-empty");
            }
            if line.baud_rate == 0 {
                anyhow::bail!("lines.baud_rate must be >= 1");
            }
            if line.addresses.is_empty() {
                anyhow::bail!("line {} must list at least one address", line.port);
            }
        }
        if self.registry.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be >= 1");
        }
        if self.poller.cycle_delay.as_millis() == 0 {
            anyhow::bail!("poller.cycle_delay_ms must be >= 1");
        }
        if self.poller.transient_backoff.as_millis() == 0 {
            anyhow::bail!("poller.transient_backoff_ms must be >= 1");
        }
        if self.poller.connect_retry_pause.as_millis() == 0 {
            anyhow::bail!("poller.connect_retry_ms must be >= 1");
        }
        if self.respawn_delay_ms == 0 {
            anyhow::bail!("respawn_delay_ms must be >= 1");
        }
        if let Some(ref influx) = self.influx {
            if influx.url.trim().is_empty() {
                anyhow::bail!("influx.url must be non-empty when set");
            }
            if influx.database.trim().is_empty() {
                anyhow::bail!("influx.database must be non-empty");
            }
            if !matches!(influx.precision.as_str(), "ns" | "u" | "ms" | "s") {
                anyhow::bail!("influx.precision must be one of ns, u, ms, s");
            }
            if influx.timeout_ms == 0 {
                anyhow::bail!("influx.timeout_ms must be >= 1");
            }
        }

        Ok(())
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            poller: SupervisorConfig::default(),
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
            influx: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    respawn_delay_ms: Option<u64>,
    lines: Option<Vec<FileLineConfig>>,
    poller: Option<FilePollerConfig>,
    influx: Option<FileInfluxConfig>,
}

#[derive(Debug, Deserialize)]
struct FileLineConfig {
    port: String,
    baud_rate: Option<u32>,
    addresses: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    cycle_delay_ms: Option<u64>,
    transient_backoff_ms: Option<u64>,
    connect_retry_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileInfluxConfig {
    url: String,
    database: Option<String>,
    precision: Option<String>,
    timeout_ms: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("AURORA_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) {
    if let Some(respawn) = file.respawn_delay_ms {
        config.respawn_delay_ms = respawn;
    }

    if let Some(lines) = file.lines {
        config.registry.lines = lines
            .into_iter()
            .map(|line| LineConfig {
                port: line.port,
                baud_rate: line.baud_rate.unwrap_or(19_200),
                addresses: line.addresses.unwrap_or_else(|| vec![2]),
            })
            .collect();
    }

    if let Some(poller) = file.poller {
        if let Some(delay_ms) = poller.cycle_delay_ms {
            config.poller.cycle_delay = Duration::from_millis(delay_ms);
        }
        if let Some(backoff_ms) = poller.transient_backoff_ms {
            config.poller.transient_backoff = Duration::from_millis(backoff_ms);
        }
        if let Some(retry_ms) = poller.connect_retry_ms {
            config.poller.connect_retry_pause = Duration::from_millis(retry_ms);
        }
        if let Some(timeout_ms) = poller.request_timeout_ms {
            config.registry.request_timeout_ms = timeout_ms;
        }
    }

    if let Some(influx) = file.influx {
        config.influx = Some(InfluxConfig {
            url: influx.url,
            database: influx
                .database
                .unwrap_or_else(|| DEFAULT_INFLUX_DATABASE.to_string()),
            precision: influx
                .precision
                .unwrap_or_else(|| DEFAULT_INFLUX_PRECISION.to_string()),
            timeout_ms: influx.timeout_ms.unwrap_or(DEFAULT_INFLUX_TIMEOUT_MS),
        });
    }
}

fn apply_env_overrides(config: &mut CollectorConfig) {
    if let Ok(value) = env::var("AURORA_LINES") {
        let lines = parse_lines(&value);
        if !lines.is_empty() {
            config.registry.lines = lines;
        }
    }

    if let Some(baud_rate) = parse_env_u32("AURORA_BAUD_RATE") {
        for line in &mut config.registry.lines {
            line.baud_rate = baud_rate;
        }
    }

    if let Some(timeout_ms) = parse_env_u64("AURORA_REQUEST_TIMEOUT_MS") {
        config.registry.request_timeout_ms = timeout_ms;
    }

    if let Some(delay_ms) = parse_env_u64("AURORA_CYCLE_DELAY_MS") {
        config.poller.cycle_delay = Duration::from_millis(delay_ms);
    }

    if let Some(backoff_ms) = parse_env_u64("AURORA_TRANSIENT_BACKOFF_MS") {
        config.poller.transient_backoff = Duration::from_millis(backoff_ms);
    }

    if let Some(retry_ms) = parse_env_u64("AURORA_CONNECT_RETRY_MS") {
        config.poller.connect_retry_pause = Duration::from_millis(retry_ms);
    }

    config.respawn_delay_ms =
        parse_env_u64("AURORA_RESPAWN_DELAY_MS").unwrap_or(config.respawn_delay_ms);

    if let Ok(url) = env::var("AURORA_INFLUX_URL") {
        let existing = config.influx.take();
        config.influx = Some(InfluxConfig {
            url,
            database: existing
                .as_ref()
                .map(|influx| influx.database.clone())
                .unwrap_or_else(|| DEFAULT_INFLUX_DATABASE.to_string()),
            precision: existing
                .as_ref()
                .map(|influx| influx.precision.clone())
                .unwrap_or_else(|| DEFAULT_INFLUX_PRECISION.to_string()),
            timeout_ms: existing
                .map(|influx| influx.timeout_ms)
                .unwrap_or(DEFAULT_INFLUX_TIMEOUT_MS),
        });
    }

    if let Some(influx) = config.influx.as_mut() {
        if let Ok(database) = env::var("AURORA_INFLUX_DATABASE") {
            influx.database = database;
        }
        if let Ok(precision) = env::var("AURORA_INFLUX_PRECISION") {
            influx.precision = precision;
        }
        if let Some(timeout_ms) = parse_env_u64("AURORA_INFLUX_TIMEOUT_MS") {
            influx.timeout_ms = timeout_ms;
        }
    }
}

/// `AURORA_LINES` holds comma-separated `port:addr[:addr...]` entries, one
/// per serial line, e.g. `/dev/ttyUSB2:2:3,/dev/ttyUSB3:2`.
fn parse_lines(value: &str) -> Vec<LineConfig> {
    value
        .split(',')
        .filter_map(|entry| {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                return None;
            }
            let mut parts = trimmed.split(':');
            let port = parts.next()?.to_string();
            let addresses: Vec<u8> = parts.filter_map(|part| part.parse().ok()).collect();
            Some(LineConfig {
                port,
                baud_rate: 19_200,
                addresses: if addresses.is_empty() { vec![2] } else { addresses },
            })
        })
        .collect()
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
