#![allow(dead_code)]

//! Serial client for Aurora (Power-One/ABB) inverters.
//!
//! Requests are 10-byte frames (bus address, command, six parameter bytes,
//! CRC16 low/high); responses are 8 bytes (six data bytes, CRC16 low/high).
//! The first response byte of most commands is a transmission state, 0 when
//! the request was understood.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const CMD_STATE: u8 = 50;
const CMD_MEASURE: u8 = 59;
const CMD_SERIAL_NUMBER: u8 = 63;
const CMD_CUMULATED_ENERGY: u8 = 78;

/// DSP measure ids for [`AuroraClient::measure`].
pub const MEASURE_GRID_VOLTAGE: u8 = 1;
pub const MEASURE_OUTPUT_CURRENT: u8 = 2;
pub const MEASURE_OUTPUT_POWER: u8 = 3;
pub const MEASURE_GRID_FREQUENCY: u8 = 4;
pub const MEASURE_INVERTER_TEMPERATURE: u8 = 21;
pub const MEASURE_BOOSTER_TEMPERATURE: u8 = 22;
pub const MEASURE_INPUT_1_VOLTAGE: u8 = 23;
pub const MEASURE_INPUT_1_CURRENT: u8 = 25;
pub const MEASURE_INPUT_2_VOLTAGE: u8 = 26;
pub const MEASURE_INPUT_2_CURRENT: u8 = 27;

/// Cumulated energy periods for [`AuroraClient::cumulated_energy`].
pub const PERIOD_DAILY: u8 = 0;
pub const PERIOD_WEEKLY: u8 = 1;
pub const PERIOD_MONTHLY: u8 = 3;
pub const PERIOD_YEARLY: u8 = 4;
pub const PERIOD_TOTAL: u8 = 5;
pub const PERIOD_SINCE_RESET: u8 = 6;

/// Which byte of the state response (command 50) to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Global,
    Inverter,
    Dcdc1,
    Dcdc2,
    Alarm,
}

/// Configuration options for one inverter on a serial line.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub path: String,
    pub baud_rate: u32,
    pub address: u8,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 19_200,
            address: 2,
            timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("serial line not connected")]
    NotConnected,
    #[error("serial open failed on {path}: {source}")]
    Connect {
        path: String,
        source: tokio_serial::Error,
    },
    #[error("response failed checksum")]
    BadChecksum,
    #[error("unknown transmission state {0}")]
    UnknownTransmissionState(u8),
    #[error("device refused request: {}", transmission_state_text(.0))]
    ResponseState(u8),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("serial io error: {0}")]
    Serial(#[from] std::io::Error),
}

/// One physical serial line, possibly shared by several logical inverters.
///
/// Clones share the underlying port handle; only one request may be in
/// flight at a time, which the strictly sequential acquisition loop already
/// guarantees. The mutex guards the frame bytes, it is not a scheduler.
#[derive(Debug, Clone)]
pub struct SharedLine {
    path: String,
    baud_rate: u32,
    stream: Arc<Mutex<Option<SerialStream>>>,
}

impl SharedLine {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            stream: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Opens the port if it is not already open. Idempotent so that two
    /// logical devices on the same line can both call connect.
    pub async fn open(&self) -> Result<(), ClientError> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let builder = tokio_serial::new(&self.path, self.baud_rate);
        let stream = builder
            .open_native_async()
            .map_err(|source| ClientError::Connect {
                path: self.path.clone(),
                source,
            })?;
        *guard = Some(stream);
        info!(path = %self.path, baud_rate = self.baud_rate, "serial line opened");
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// True when both handles refer to the same physical port.
    pub fn same_line(&self, other: &SharedLine) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }

    async fn transact(&self, request: &[u8; 10], response: &mut [u8; 8]) -> Result<(), ClientError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(ClientError::NotConnected)?;
        stream.write_all(request).await?;
        stream.read_exact(response).await?;
        Ok(())
    }
}

/// Client for one logical inverter: a bus address bound to a [`SharedLine`].
#[derive(Debug, Clone)]
pub struct AuroraClient {
    line: SharedLine,
    address: u8,
    timeout: Duration,
}

impl AuroraClient {
    pub fn new(line: SharedLine, address: u8, timeout: Duration) -> Self {
        Self {
            line,
            address,
            timeout,
        }
    }

    pub fn from_config(config: ClientConfig) -> Self {
        let line = SharedLine::new(config.path, config.baud_rate);
        Self::new(line, config.address, Duration::from_millis(config.timeout_ms))
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn line(&self) -> &SharedLine {
        &self.line
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.line.open().await
    }

    /// Reads one DSP measurement (command 59) as an f32.
    pub async fn measure(&self, id: u8) -> Result<f32, ClientError> {
        let data = self.request_checked(CMD_MEASURE, [id, 0, 0, 0, 0, 0]).await?;
        let value = f32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        debug!(address = self.address, id, value, "measure ok");
        Ok(value)
    }

    /// Reads a cumulated energy counter (command 78) in watt-hours.
    pub async fn cumulated_energy(&self, period: u8) -> Result<f64, ClientError> {
        let data = self
            .request_checked(CMD_CUMULATED_ENERGY, [period, 0, 0, 0, 0, 0])
            .await?;
        let wh = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        debug!(address = self.address, period, wh, "cumulated energy ok");
        Ok(f64::from(wh))
    }

    /// Reads the state response (command 50) and renders the requested byte.
    pub async fn state(&self, kind: StateKind) -> Result<String, ClientError> {
        let data = self.request_checked(CMD_STATE, [0; 6]).await?;
        let code = match kind {
            StateKind::Global => data[1],
            StateKind::Inverter => data[2],
            StateKind::Dcdc1 => data[3],
            StateKind::Dcdc2 => data[4],
            StateKind::Alarm => data[5],
        };
        Ok(state_text(kind, code).to_string())
    }

    /// Reads the serial number (command 63). The response carries six ASCII
    /// characters and no transmission state.
    pub async fn serial_number(&self) -> Result<String, ClientError> {
        let data = self.request(CMD_SERIAL_NUMBER, [0; 6]).await?;
        let serial: String = data
            .iter()
            .map(|&byte| byte as char)
            .filter(|ch| ch.is_ascii_graphic())
            .collect();
        Ok(serial)
    }

    async fn request(&self, command: u8, params: [u8; 6]) -> Result<[u8; 6], ClientError> {
        let frame = build_frame(self.address, command, &params);
        let mut response = [0u8; 8];
        let timeout_ms = self.timeout.as_millis() as u64;
        timeout(self.timeout, self.line.transact(&frame, &mut response))
            .await
            .map_err(|_| {
                warn!(address = self.address, command, timeout_ms, "request timed out");
                ClientError::Timeout { timeout_ms }
            })??;
        verify_response(&response)
    }

    async fn request_checked(&self, command: u8, params: [u8; 6]) -> Result<[u8; 6], ClientError> {
        let data = self.request(command, params).await?;
        check_transmission_state(data[0])?;
        Ok(data)
    }
}

/// CRC16 used by the Aurora protocol: poly 0x8408, init 0xFFFF, complemented.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        let mut bits = u16::from(byte);
        for _ in 0..8 {
            let mix = (crc ^ bits) & 0x01 != 0;
            crc >>= 1;
            if mix {
                crc ^= 0x8408;
            }
            bits >>= 1;
        }
    }
    !crc
}

fn build_frame(address: u8, command: u8, params: &[u8; 6]) -> [u8; 10] {
    let mut frame = [0u8; 10];
    frame[0] = address;
    frame[1] = command;
    frame[2..8].copy_from_slice(params);
    let crc = crc16(&frame[..8]);
    frame[8] = (crc & 0xFF) as u8;
    frame[9] = (crc >> 8) as u8;
    frame
}

fn verify_response(response: &[u8; 8]) -> Result<[u8; 6], ClientError> {
    let expected = crc16(&response[..6]);
    let received = u16::from(response[6]) | (u16::from(response[7]) << 8);
    if expected != received {
        return Err(ClientError::BadChecksum);
    }
    let mut data = [0u8; 6];
    data.copy_from_slice(&response[..6]);
    Ok(data)
}

fn check_transmission_state(code: u8) -> Result<(), ClientError> {
    match code {
        0 => Ok(()),
        51..=58 => Err(ClientError::ResponseState(code)),
        other => Err(ClientError::UnknownTransmissionState(other)),
    }
}

fn transmission_state_text(code: &u8) -> &'static str {
    match *code {
        51 => "command not implemented",
        52 => "variable does not exist",
        53 => "value out of range",
        54 => "eeprom not accessible",
        55 => "not in service-mode",
        56 => "internal micro not reachable",
        57 => "command not executed",
        58 => "variable not available",
        _ => "unrecognized transmission state",
    }
}

fn state_text(kind: StateKind, code: u8) -> &'static str {
    match kind {
        StateKind::Inverter => inverter_state_text(code),
        StateKind::Global => global_state_text(code),
        // The DC/DC and alarm tables are large; unmapped codes fall through.
        _ => fallback_state_text(code),
    }
}

fn inverter_state_text(code: u8) -> &'static str {
    match code {
        0 => "Stand By",
        1 => "Checking Grid",
        2 => "Run",
        3 => "Bulk OV",
        4 => "Out OC",
        5 => "IGBT Sat",
        6 => "Bulk UV",
        7 => "Degauss Error",
        8 => "No Parameters",
        9 => "Bulk Low",
        10 => "Grid OV",
        11 => "Communication Error",
        12 => "Degaussing",
        13 => "Starting",
        14 => "Bulk Cap Fail",
        15 => "Leak Fail",
        16 => "DcDc Fail",
        17 => "Ileak Sensor Fail",
        _ => "Unknown",
    }
}

fn global_state_text(code: u8) -> &'static str {
    match code {
        0 => "Sending Parameters",
        1 => "Wait Sun/Grid",
        2 => "Checking Grid",
        3 => "Measuring Riso",
        4 => "DcDc Start",
        5 => "Inverter Start",
        6 => "Run",
        7 => "Recovery",
        8 => "Pause",
        9 => "Ground Fault",
        10 => "OTH Fault",
        _ => "Unknown",
    }
}

fn fallback_state_text(code: u8) -> &'static str {
    match code {
        0 => "OK",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_of_empty_input_is_complement_of_seed() {
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn crc_distinguishes_inputs() {
        assert_ne!(crc16(&[0x00]), crc16(&[0x01]));
        assert_ne!(crc16(&[0x02, 0x3B]), crc16(&[0x03, 0x3B]));
    }

    #[test]
    fn frame_carries_address_command_and_trailer() {
        let frame = build_frame(2, CMD_MEASURE, &[MEASURE_GRID_VOLTAGE, 0, 0, 0, 0, 0]);
        assert_eq!(frame[0], 2);
        assert_eq!(frame[1], CMD_MEASURE);
        assert_eq!(frame[2], MEASURE_GRID_VOLTAGE);
        let crc = crc16(&frame[..8]);
        assert_eq!(frame[8], (crc & 0xFF) as u8);
        assert_eq!(frame[9], (crc >> 8) as u8);
    }

    #[test]
    fn verify_accepts_well_formed_response() {
        let mut response = [0u8, 6, 0x43, 0x6B, 0x80, 0x00, 0, 0];
        let crc = crc16(&response[..6]);
        response[6] = (crc & 0xFF) as u8;
        response[7] = (crc >> 8) as u8;

        let data = verify_response(&response).expect("valid response");
        assert_eq!(data[0], 0);
        let value = f32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        assert!((value - 235.5).abs() < f32::EPSILON);
    }

    #[test]
    fn verify_rejects_corrupted_response() {
        let mut response = [0u8, 6, 0x43, 0x6B, 0x80, 0x00, 0, 0];
        let crc = crc16(&response[..6]);
        response[6] = (crc & 0xFF) as u8;
        response[7] = (crc >> 8) as u8;
        response[3] ^= 0xFF;

        assert!(matches!(
            verify_response(&response),
            Err(ClientError::BadChecksum)
        ));
    }

    #[test]
    fn transmission_state_zero_is_ok() {
        assert!(check_transmission_state(0).is_ok());
    }

    #[test]
    fn known_refusal_codes_map_to_response_state() {
        for code in 51..=58 {
            assert!(matches!(
                check_transmission_state(code),
                Err(ClientError::ResponseState(c)) if c == code
            ));
        }
    }

    #[test]
    fn unexpected_codes_map_to_unknown_transmission_state() {
        assert!(matches!(
            check_transmission_state(99),
            Err(ClientError::UnknownTransmissionState(99))
        ));
    }

    #[test]
    fn inverter_state_table_covers_run() {
        assert_eq!(inverter_state_text(2), "Run");
        assert_eq!(inverter_state_text(200), "Unknown");
    }
}
