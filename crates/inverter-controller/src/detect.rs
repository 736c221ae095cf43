use modbus_client::ModbusClient;
use register_map::{
    connection_type, model_for, probe_addresses, ConnectionTypeKey, InverterModel, ProbeResults,
    IDENTITY_REGISTER_COUNT,
};
use tracing::{info, warn};
use value_codec::decode_ascii;

use crate::ControllerError;

/// Reads the identification block and matches it against the model catalog.
///
/// Returns the catalog's base model and the full model string the inverter
/// reported.
pub async fn autodetect(
    client: &ModbusClient,
    key: ConnectionTypeKey,
    slave: u8,
) -> Result<(&'static str, String), ControllerError> {
    let profile = connection_type(key);
    let words = client
        .read_registers(
            slave,
            profile.identity_register_type,
            profile.identity_address,
            IDENTITY_REGISTER_COUNT,
        )
        .await?;

    let full_model = decode_ascii(&words);

    match model_for(&full_model) {
        Some(model) => {
            info!(slave, connection_type = %key, model = %full_model, base_model = model.base_model, "inverter detected");
            Ok((model.base_model, full_model))
        }
        None => {
            warn!(slave, connection_type = %key, model = %full_model, "unsupported inverter model");
            Err(ControllerError::UnsupportedModel(full_model))
        }
    }
}

/// Reads every probe register for the model. A probe that fails with a
/// protocol error is left out; predicates treat it as absent.
pub(crate) async fn read_probes(
    client: &ModbusClient,
    model: &InverterModel,
    key: ConnectionTypeKey,
    slave: u8,
) -> Result<ProbeResults, ControllerError> {
    let mut probes = ProbeResults::new();
    for (register_type, address) in probe_addresses(model, key) {
        match client.read_registers(slave, register_type, address, 1).await {
            Ok(words) => {
                if let Some(word) = words.first() {
                    probes.insert(address, *word);
                }
            }
            Err(err) if err.is_connection() => return Err(err.into()),
            Err(err) => {
                warn!(slave, address, error = %err, "probe register unreadable");
            }
        }
    }
    Ok(probes)
}
