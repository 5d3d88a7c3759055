//! Named connectors
//!
//! An explicit registry object replaces a process-wide connection list.
//! Every connector it creates shares the registry's driver.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connector::{ConnectionParams, DatabaseConnector, SqlDriver};
use crate::error::RegistryError;
use pgmirror_api::make_id;

pub struct ConnectorRegistry {
    driver: Arc<dyn SqlDriver>,
    connectors: Mutex<BTreeMap<String, Arc<DatabaseConnector>>>,
}

impl ConnectorRegistry {
    pub fn new(driver: Arc<dyn SqlDriver>) -> Self {
        Self {
            driver,
            connectors: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<DatabaseConnector>>> {
        self.connectors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a connector. Without a name one is generated as
    /// `{database}-{uuid}`. Returns the name it was registered under.
    pub fn add_connection(
        &self,
        database: &str,
        host: &str,
        port: u16,
        name: Option<&str>,
    ) -> Result<String, RegistryError> {
        self.add_with_params(ConnectionParams::new(host, port, database), name)
    }

    pub fn add_with_params(
        &self,
        params: ConnectionParams,
        name: Option<&str>,
    ) -> Result<String, RegistryError> {
        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}-{}", params.database, make_id()),
        };

        let mut connectors = self.lock();
        if connectors.contains_key(&name) {
            tracing::warn!(
                "[ConnectorRegistry] can't add connection, name already exists: {}",
                name
            );
            return Err(RegistryError::DuplicateName(name));
        }

        let connector = DatabaseConnector::with_params(Arc::clone(&self.driver), params);
        connector.set_connection_name(name.clone());
        connectors.insert(name.clone(), Arc::new(connector));
        tracing::debug!("[ConnectorRegistry] added connection {}", name);
        Ok(name)
    }

    pub fn connector(&self, name: &str) -> Option<Arc<DatabaseConnector>> {
        self.lock().get(name).cloned()
    }

    /// Remove and disconnect a connector. Returns false for unknown names.
    pub fn remove_connection(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(connector) => {
                connector.disconnect();
                true
            }
            None => false,
        }
    }

    pub async fn open(&self, name: &str, username: &str, password: &str) -> Result<(), RegistryError> {
        let connector = self.require(name)?;
        connector.connect(username, password).await?;
        Ok(())
    }

    pub fn close(&self, name: &str) -> Result<(), RegistryError> {
        self.require(name)?.disconnect();
        Ok(())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn require(&self, name: &str) -> Result<Arc<DatabaseConnector>, RegistryError> {
        self.connector(name).ok_or_else(|| {
            tracing::warn!("[ConnectorRegistry] don't have connection named {}", name);
            RegistryError::UnknownConnection(name.to_string())
        })
    }
}
