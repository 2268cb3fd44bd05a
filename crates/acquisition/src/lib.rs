//! The acquisition core: device lifecycle, per-cycle measurement collection,
//! communication-error classification, and point publishing.
//!
//! Devices are polled strictly sequentially, one cycle at a time; on a shared
//! serial line this ordering is what keeps frames from interleaving.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use aurora_client::{
    AuroraClient, ClientError, StateKind, MEASURE_GRID_VOLTAGE, MEASURE_INPUT_1_CURRENT,
    MEASURE_INPUT_2_CURRENT, MEASURE_OUTPUT_CURRENT, MEASURE_OUTPUT_POWER, PERIOD_DAILY,
    PERIOD_TOTAL,
};
use influx_sink::{InfluxWriter, PublishError};
use types::{DeviceIdentity, MetricValue, Point};

/// How one catalog entry is obtained from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricRead {
    EnergyToday,
    EnergyTotal,
    InverterStatus,
    OutputPower,
    GridVoltage,
    OutputCurrent,
    /// Derived: input-1 current + input-2 current, both read in the same cycle.
    InputCurrentTotal,
}

const CATALOG: &[(&str, MetricRead)] = &[
    ("PV_Energy_Today", MetricRead::EnergyToday),
    ("PV_Energy_Total", MetricRead::EnergyTotal),
    ("Inverter_Status", MetricRead::InverterStatus),
    ("PV_Power", MetricRead::OutputPower),
    ("PV_Voltage", MetricRead::GridVoltage),
    ("Output_Watts", MetricRead::OutputPower),
    ("Output_Current", MetricRead::OutputCurrent),
    ("Input_Current_Total", MetricRead::InputCurrentTotal),
];

/// Names of every metric a successful cycle yields, in publish order.
pub fn metric_names() -> Vec<&'static str> {
    CATALOG.iter().map(|(name, _)| *name).collect()
}

/// The device operations the acquisition loop needs. Implemented for
/// [`AuroraClient`]; tests substitute scripted links.
#[async_trait]
pub trait DeviceLink: Send {
    async fn connect(&mut self) -> Result<(), ClientError>;
    async fn measure(&mut self, id: u8) -> Result<f32, ClientError>;
    async fn cumulated_energy(&mut self, period: u8) -> Result<f64, ClientError>;
    async fn inverter_state(&mut self) -> Result<String, ClientError>;
    async fn serial_number(&mut self) -> Result<String, ClientError>;
}

#[async_trait]
impl DeviceLink for AuroraClient {
    async fn connect(&mut self) -> Result<(), ClientError> {
        AuroraClient::connect(self).await
    }

    async fn measure(&mut self, id: u8) -> Result<f32, ClientError> {
        AuroraClient::measure(self, id).await
    }

    async fn cumulated_energy(&mut self, period: u8) -> Result<f64, ClientError> {
        AuroraClient::cumulated_energy(self, period).await
    }

    async fn inverter_state(&mut self) -> Result<String, ClientError> {
        self.state(StateKind::Inverter).await
    }

    async fn serial_number(&mut self) -> Result<String, ClientError> {
        AuroraClient::serial_number(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// One addressable inverter: a link plus its connection state and the
/// serial-number identity, fetched once on first success and cached for the
/// device lifetime.
#[derive(Debug, Clone)]
pub struct Device<L> {
    identity: DeviceIdentity,
    link: L,
    state: LinkState,
    serial: Option<String>,
}

impl<L: DeviceLink> Device<L> {
    pub fn new(identity: DeviceIdentity, link: L) -> Self {
        Self {
            identity,
            link,
            state: LinkState::Disconnected,
            serial: None,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.state = LinkState::Connecting;
        match self.link.connect().await {
            Ok(()) => {
                self.state = LinkState::Connected;
                info!(device = %self.identity, "device connected");
                Ok(())
            }
            Err(err) => {
                self.state = LinkState::Disconnected;
                Err(err)
            }
        }
    }

    pub async fn serial_number(&mut self) -> Result<String, ClientError> {
        if let Some(serial) = &self.serial {
            return Ok(serial.clone());
        }
        let serial = self.link.serial_number().await?;
        info!(device = %self.identity, serial = %serial, "serial number cached");
        self.serial = Some(serial.clone());
        Ok(serial)
    }
}

/// One complete cycle of readings for a device; keys are exactly the
/// configured catalog, in catalog order.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    values: Vec<(&'static str, MetricValue)>,
}

impl MeasurementSet {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, MetricValue)> {
        self.values.iter()
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

pub struct MeasurementCollector;

impl MeasurementCollector {
    /// Issues the fixed read sequence against a connected device. Any failed
    /// read aborts the cycle for this device; no partial set is returned.
    pub async fn poll<L: DeviceLink>(device: &mut Device<L>) -> Result<MeasurementSet, ClientError> {
        if device.state != LinkState::Connected {
            return Err(ClientError::NotConnected);
        }

        let mut values = Vec::with_capacity(CATALOG.len());
        for (name, read) in CATALOG {
            let value = match read {
                MetricRead::EnergyToday => {
                    MetricValue::Float(device.link.cumulated_energy(PERIOD_DAILY).await?)
                }
                MetricRead::EnergyTotal => {
                    MetricValue::Float(device.link.cumulated_energy(PERIOD_TOTAL).await?)
                }
                MetricRead::InverterStatus => {
                    MetricValue::Text(device.link.inverter_state().await?)
                }
                MetricRead::OutputPower => {
                    MetricValue::Float(f64::from(device.link.measure(MEASURE_OUTPUT_POWER).await?))
                }
                MetricRead::GridVoltage => {
                    MetricValue::Float(f64::from(device.link.measure(MEASURE_GRID_VOLTAGE).await?))
                }
                MetricRead::OutputCurrent => MetricValue::Float(f64::from(
                    device.link.measure(MEASURE_OUTPUT_CURRENT).await?,
                )),
                MetricRead::InputCurrentTotal => {
                    let input_1 = device.link.measure(MEASURE_INPUT_1_CURRENT).await?;
                    let input_2 = device.link.measure(MEASURE_INPUT_2_CURRENT).await?;
                    MetricValue::Float(f64::from(input_1 + input_2))
                }
            };
            values.push((*name, value));
        }

        Ok(MeasurementSet { values })
    }
}

/// What the loop does with a failed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Re-establish the session, then retry the poll once this cycle.
    Reconnect,
    /// Sleep a short fixed interval, abandon the device for this cycle.
    ShortBackoffSkip,
    /// Abandon the device for this cycle, no sleep, no reconnect.
    SkipDevice,
}

/// Pure decision table over the error kind.
pub fn classify(error: &ClientError) -> Action {
    match error {
        ClientError::NotConnected => Action::Reconnect,
        ClientError::BadChecksum => Action::ShortBackoffSkip,
        ClientError::UnknownTransmissionState(_) => Action::ShortBackoffSkip,
        _ => Action::SkipDevice,
    }
}

/// Where finished points go. Implemented for [`InfluxWriter`]; tests record
/// points in memory.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn write(&self, point: &Point) -> Result<(), PublishError>;
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write(&self, point: &Point) -> Result<(), PublishError> {
        self.write_point(point).await
    }
}

/// Turns a measurement set into points and hands them to the store client.
pub struct PublishSink<S> {
    sink: S,
}

impl<S: PointSink> PublishSink<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// One point per (metric, value) pair, tagged with the device serial.
    /// A failed write is logged and does not suppress the remaining points.
    /// Returns how many points were written.
    pub async fn publish(&self, serial: &str, set: &MeasurementSet) -> usize {
        let timestamp_ms = unix_ms();
        let mut written = 0;
        for (name, value) in set.iter() {
            let point = Point::new(*name)
                .tag("sensor", serial)
                .field("value", value.clone())
                .timestamp_ms(timestamp_ms);
            match self.sink.write(&point).await {
                Ok(()) => written += 1,
                Err(err) => {
                    warn!(measurement = *name, error = %err, "point write failed");
                }
            }
        }
        written
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no devices registered")]
    NoDevices,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pause between full cycles.
    pub cycle_delay: Duration,
    /// Sleep after a transient fault before moving to the next device.
    pub transient_backoff: Duration,
    /// Pause between startup connect attempts, which retry indefinitely.
    pub connect_retry_pause: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cycle_delay: Duration::from_secs(2),
            transient_backoff: Duration::from_millis(500),
            connect_retry_pause: Duration::from_secs(5),
        }
    }
}

/// Drives the infinite poll cycle over all registered devices.
///
/// Per-device faults are classified and handled inside the cycle; reconnect
/// is attempted at most once per device per cycle. Defect-class faults that
/// escape this loop are caught by the binary's respawn boundary, which logs,
/// pauses, and restarts the whole loop.
pub struct AcquisitionSupervisor<L, S> {
    devices: Vec<Device<L>>,
    sink: PublishSink<S>,
    config: SupervisorConfig,
    shutdown: watch::Receiver<bool>,
    cycles: u64,
}

impl<L: DeviceLink, S: PointSink> AcquisitionSupervisor<L, S> {
    pub fn new(
        devices: Vec<Device<L>>,
        sink: S,
        config: SupervisorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            devices,
            sink: PublishSink::new(sink),
            config,
            shutdown,
            cycles: 0,
        }
    }

    /// Completed cycle count since startup.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub async fn run(mut self) -> Result<(), SupervisorError> {
        if self.devices.is_empty() {
            return Err(SupervisorError::NoDevices);
        }

        self.connect_all().await;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.run_cycle().await;

            tokio::select! {
                _ = sleep(self.config.cycle_delay) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(cycles = self.cycles, "acquisition stopped");
        Ok(())
    }

    /// Connects every device. Unlike in-cycle polling, which reconnects at
    /// most once, startup connection establishment retries indefinitely.
    pub async fn connect_all(&mut self) {
        for idx in 0..self.devices.len() {
            loop {
                if *self.shutdown.borrow() {
                    return;
                }
                let device = &mut self.devices[idx];
                match device.connect().await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(
                            device = %device.identity(),
                            error = %err,
                            "connect failed, retrying"
                        );
                        sleep(self.config.connect_retry_pause).await;
                    }
                }
            }
        }
    }

    /// One pass over all devices in registration order.
    pub async fn run_cycle(&mut self) {
        for idx in 0..self.devices.len() {
            self.poll_device(idx).await;
        }
        self.cycles = self.cycles.wrapping_add(1);
        info!(cycle = self.cycles, devices = self.devices.len(), "poll cycle complete");
    }

    async fn poll_device(&mut self, idx: usize) {
        let set = match MeasurementCollector::poll(&mut self.devices[idx]).await {
            Ok(set) => set,
            Err(err) => match classify(&err) {
                Action::Reconnect => {
                    let device = &mut self.devices[idx];
                    warn!(
                        device = %device.identity(),
                        error = %err,
                        "session not established, reconnecting"
                    );
                    if let Err(connect_err) = device.connect().await {
                        warn!(
                            device = %device.identity(),
                            error = %connect_err,
                            "reconnect failed, device skipped this cycle"
                        );
                        return;
                    }
                    // One retry per cycle; a failure here is swallowed and
                    // the device waits for the next cycle.
                    match MeasurementCollector::poll(device).await {
                        Ok(set) => set,
                        Err(retry_err) => {
                            warn!(
                                device = %device.identity(),
                                error = %retry_err,
                                "poll after reconnect failed, device skipped this cycle"
                            );
                            return;
                        }
                    }
                }
                Action::ShortBackoffSkip => {
                    warn!(
                        device = %self.devices[idx].identity(),
                        error = %err,
                        "transient fault, backing off"
                    );
                    sleep(self.config.transient_backoff).await;
                    return;
                }
                Action::SkipDevice => {
                    warn!(
                        device = %self.devices[idx].identity(),
                        error = %err,
                        "device skipped this cycle"
                    );
                    return;
                }
            },
        };

        let serial = match self.devices[idx].serial_number().await {
            Ok(serial) => serial,
            Err(err) => {
                warn!(
                    device = %self.devices[idx].identity(),
                    error = %err,
                    "serial number query failed, measurements dropped"
                );
                return;
            }
        };

        let written = self.sink.publish(&serial, &set).await;
        debug!(device = %self.devices[idx].identity(), points = written, "device published");
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_triggers_reconnect() {
        assert_eq!(classify(&ClientError::NotConnected), Action::Reconnect);
    }

    #[test]
    fn corrupted_frames_back_off_and_skip() {
        assert_eq!(classify(&ClientError::BadChecksum), Action::ShortBackoffSkip);
        assert_eq!(
            classify(&ClientError::UnknownTransmissionState(99)),
            Action::ShortBackoffSkip
        );
    }

    #[test]
    fn anything_else_skips_without_reconnect() {
        assert_eq!(
            classify(&ClientError::Timeout { timeout_ms: 1_000 }),
            Action::SkipDevice
        );
        assert_eq!(
            classify(&ClientError::ResponseState(52)),
            Action::SkipDevice
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(classify(&ClientError::Serial(io)), Action::SkipDevice);
    }

    #[test]
    fn catalog_covers_the_configured_metrics() {
        let names = metric_names();
        assert_eq!(names.len(), 8);
        assert_eq!(names[0], "PV_Energy_Today");
        assert!(names.contains(&"Input_Current_Total"));
        assert!(names.contains(&"Inverter_Status"));
    }
}
