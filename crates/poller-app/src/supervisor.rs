use std::sync::Arc;
use std::time::Duration;

use inverter_controller::{ControllerError, ControllerHandle, InverterController, PollEvent};
use modbus_client::ModbusClient;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::InverterConnectionConfig;

/// Sets up the controller for one inverter. Connection failures are retried
/// until setup succeeds or shutdown is requested, so an offline inverter does
/// not hold up the others. Any other setup error, such as a model missing
/// from the catalog, is returned at once.
pub async fn start_inverter(
    client: Arc<ModbusClient>,
    connection: &InverterConnectionConfig,
    retry_delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<ControllerHandle>, ControllerError> {
    loop {
        if *shutdown.borrow() {
            return Ok(None);
        }

        match InverterController::setup(Arc::clone(&client), connection.controller_config()).await {
            Ok(controller) => {
                info!(
                    inverter = %connection.name,
                    endpoint = %client.key(),
                    adapter = connection.adapter_id,
                    slave = connection.slave_id,
                    "inverter polling started"
                );
                return Ok(Some(controller.spawn()));
            }
            Err(ControllerError::Client(err)) if err.is_connection() => {
                warn!(
                    inverter = %connection.name,
                    endpoint = %client.key(),
                    error = %err,
                    retry_ms = retry_delay.as_millis() as u64,
                    "inverter setup failed"
                );
                tokio::select! {
                    _ = sleep(retry_delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(None);
                        }
                    }
                }
            }
            Err(err) => {
                error!(
                    inverter = %connection.name,
                    endpoint = %client.key(),
                    error = %err,
                    "inverter setup aborted"
                );
                return Err(err);
            }
        }
    }
}

/// Logs every event a controller publishes until shutdown, then stops the
/// controller.
pub async fn log_events(handle: ControllerHandle, mut shutdown: watch::Receiver<bool>) {
    let mut events = handle.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PollEvent::Updated(result)) => {
                    info!(
                        inverter = %result.inverter,
                        values = result.values.len(),
                        unavailable = result.unavailable.len(),
                        "poll result published"
                    );
                    match serde_json::to_string(&*result) {
                        Ok(payload) => debug!(inverter = %result.inverter, %payload, "poll result"),
                        Err(err) => warn!(inverter = %result.inverter, error = %err, "poll result serialization failed"),
                    }
                }
                Ok(PollEvent::CycleFailed { reason }) => {
                    warn!(inverter = %handle.name(), %reason, "poll cycle failed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(inverter = %handle.name(), skipped, "poll events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    handle.shutdown().await;
    info!(inverter = %handle.name(), "inverter stopped");
}
