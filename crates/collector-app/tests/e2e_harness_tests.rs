use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use acquisition::{AcquisitionSupervisor, Device, DeviceLink, PointSink, SupervisorConfig};
use aurora_client::ClientError;
use influx_sink::{to_line_protocol, PublishError};
use types::{DeviceIdentity, Point};

#[derive(Debug, Clone)]
struct StubLink;

#[async_trait]
impl DeviceLink for StubLink {
    async fn connect(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn measure(&mut self, id: u8) -> Result<f32, ClientError> {
        Ok(f32::from(id) * 10.0)
    }

    async fn cumulated_energy(&mut self, period: u8) -> Result<f64, ClientError> {
        Ok(5_000.0 + f64::from(period))
    }

    async fn inverter_state(&mut self) -> Result<String, ClientError> {
        Ok("Run".to_string())
    }

    async fn serial_number(&mut self) -> Result<String, ClientError> {
        Ok("AUR123".to_string())
    }
}

#[derive(Debug, Clone, Default)]
struct RecordingSink {
    points: Arc<Mutex<Vec<Point>>>,
}

#[async_trait]
impl PointSink for RecordingSink {
    async fn write(&self, point: &Point) -> Result<(), PublishError> {
        self.points.lock().expect("points lock").push(point.clone());
        Ok(())
    }
}

#[tokio::test]
async fn e2e_harness_collects_and_encodes_points() {
    let identity = DeviceIdentity {
        port: "/dev/ttyUSB2".to_string(),
        address: 2,
    };
    let device = Device::new(identity, StubLink);
    let sink = RecordingSink::default();
    let (_tx, rx) = watch::channel(false);
    let config = SupervisorConfig {
        cycle_delay: Duration::from_millis(1),
        transient_backoff: Duration::from_millis(1),
        connect_retry_pause: Duration::from_millis(1),
    };
    let mut supervisor = AcquisitionSupervisor::new(vec![device], sink.clone(), config, rx);

    supervisor.connect_all().await;
    supervisor.run_cycle().await;

    let points = sink.points.lock().expect("points lock").clone();
    assert_eq!(points.len(), acquisition::metric_names().len());

    for point in &points {
        let line = to_line_protocol(point).expect("encode");
        assert!(line.starts_with(&point.measurement));
        assert!(line.contains("sensor=AUR123"));
        assert!(line.contains("value="));
        assert!(point.timestamp_ms.is_some());
    }
}
