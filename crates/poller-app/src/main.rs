use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use modbus_client::ClientPool;
use poller_app::{log_events, start_inverter, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_config_arg();
    let config = AppConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    let connections = config.connections().context("resolve inverters failed")?;

    if let Some(ref listen) = config.metrics_listen {
        install_metrics_exporter(listen)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = ClientPool::new(config.modbus.clone());
    let retry_delay = Duration::from_millis(config.setup_retry_ms);

    let mut join_set = JoinSet::new();
    for connection in connections {
        let client = pool
            .client(&connection.connection_key(), connection.baud_rate)
            .with_context(|| format!("create modbus client for {}", connection.name))?;
        let mut shutdown = shutdown_rx.clone();
        join_set.spawn(async move {
            match start_inverter(client, &connection, retry_delay, &mut shutdown).await {
                Ok(Some(handle)) => log_events(handle, shutdown).await,
                Ok(None) => {}
                Err(err) => warn!(inverter = %connection.name, error = %err, "inverter will not be polled"),
            }
            connection.name
        });
    }
    info!(inverters = join_set.len(), links = pool.len(), "inverter poller started");

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(name) => info!(inverter = %name, "inverter task finished"),
            Err(err) => warn!(error = %err, "inverter task join failed"),
        }
    }

    pool.close_all().await;
    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn install_metrics_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("parse metrics listen address {listen}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("install prometheus exporter")?;
    info!(listen = %addr, "metrics exporter listening");
    Ok(())
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
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
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
