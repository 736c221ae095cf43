use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use types::ConnectionKey;

use crate::{default_connector, ClientConfig, ClientError, Connector, ModbusClient};

/// Builds the connector for a key the pool has not seen yet.
pub type ConnectorFactory =
    Box<dyn Fn(&ConnectionKey, u32) -> Result<Box<dyn Connector>, ClientError> + Send + Sync>;

/// Hands out one shared client per `(transport, endpoint)`, so inverters
/// behind the same adapter serialise on the same link.
pub struct ClientPool {
    config: ClientConfig,
    factory: ConnectorFactory,
    clients: Mutex<HashMap<ConnectionKey, Arc<ModbusClient>>>,
}

impl ClientPool {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_factory(config, Box::new(default_connector))
    }

    pub fn with_factory(config: ClientConfig, factory: ConnectorFactory) -> Self {
        Self {
            config,
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client for `key`, creating it on first use. `baud_rate`
    /// only matters for serial links and is taken from the first caller.
    pub fn client(&self, key: &ConnectionKey, baud_rate: u32) -> Result<Arc<ModbusClient>, ClientError> {
        let mut clients = self.lock();
        if let Some(client) = clients.get(key) {
            debug!(endpoint = %key, "reusing pooled modbus client");
            return Ok(Arc::clone(client));
        }

        let connector = (self.factory)(key, baud_rate)?;
        let client = Arc::new(ModbusClient::with_connector(
            key.clone(),
            self.config.clone(),
            connector,
        ));
        clients.insert(key.clone(), Arc::clone(&client));
        info!(endpoint = %key, "created modbus client");
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every link and forgets the clients.
    pub async fn close_all(&self) {
        let clients: Vec<Arc<ModbusClient>> = self.lock().drain().map(|(_, client)| client).collect();
        for client in clients {
            client.close().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Arc<ModbusClient>>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
