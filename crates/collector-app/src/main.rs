use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use acquisition::{AcquisitionSupervisor, Device, SupervisorConfig, SupervisorError};
use aurora_client::AuroraClient;
use collector_app::CollectorConfig;
use influx_sink::InfluxWriter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = CollectorConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let clients = registry::register(&config.registry).context("device registration failed")?;
    if clients.is_empty() {
        warn!("no devices registered");
    }
    let devices: Vec<Device<AuroraClient>> = clients
        .into_iter()
        .map(|(identity, client)| Device::new(identity, client))
        .collect();

    let writer = match &config.influx {
        Some(influx) => {
            InfluxWriter::new_http(influx.clone()).context("influx writer init failed")?
        }
        None => {
            warn!("no influx endpoint configured, writes will be logged only");
            InfluxWriter::new_mock("mydb")
        }
    };

    let spec = SupervisorSpec {
        devices,
        writer,
        poller: config.poller.clone(),
        shutdown: shutdown_rx.clone(),
    };

    let mut join_set = JoinSet::new();
    if !spec.devices.is_empty() {
        spawn_supervisor(spec.clone(), &mut join_set, Duration::from_millis(0));
    }

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
            maybe_result = join_set.join_next() => {
                match maybe_result {
                    Some(Ok(Ok(()))) => {
                        info!("acquisition exited cleanly");
                        break;
                    }
                    Some(Ok(Err(err))) => {
                        warn!(error = %err, "acquisition exited with error, restarting");
                        spawn_supervisor(
                            spec.clone(),
                            &mut join_set,
                            Duration::from_millis(config.respawn_delay_ms),
                        );
                    }
                    Some(Err(err)) => {
                        // Panic-class defects land here; the loop is restarted
                        // after a pause rather than taking the process down.
                        warn!(error = %err, "acquisition task failed, restarting");
                        spawn_supervisor(
                            spec.clone(),
                            &mut join_set,
                            Duration::from_millis(config.respawn_delay_ms),
                        );
                    }
                    None => break,
                }
            }
        }
    }

    join_set.abort_all();
    while let Some(result) = join_set.join_next().await {
        if let Err(err) = result {
            warn!(error = %err, "acquisition task join failed");
        }
    }

    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

#[derive(Clone)]
struct SupervisorSpec {
    devices: Vec<Device<AuroraClient>>,
    writer: InfluxWriter,
    poller: SupervisorConfig,
    shutdown: watch::Receiver<bool>,
}

fn spawn_supervisor(
    spec: SupervisorSpec,
    join_set: &mut JoinSet<Result<(), SupervisorError>>,
    delay: Duration,
) {
    join_set.spawn(async move {
        if delay > Duration::from_millis(0) {
            sleep(delay).await;
        }
        let supervisor =
            AcquisitionSupervisor::new(spec.devices, spec.writer, spec.poller, spec.shutdown);
        supervisor.run().await
    });
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
