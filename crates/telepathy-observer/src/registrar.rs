//! Registers shared observers on the bus.

use telepathy_core::{ClientRegistrar, Observer, OperationError};
use tokio::runtime::Handle;
use tracing::{info, warn};
use zbus::names::WellKnownName;
use zbus::zvariant::ObjectPath;
use zbus::Connection;

use crate::observer_server::{client_bus_name, client_object_path, export_observer, withdraw_observer};

/// Exports observers created by the registry. Names are checked up front;
/// exporting itself runs on the runtime and failures are logged.
pub struct DbusRegistrar {
    connection: Connection,
    runtime: Handle,
}

impl DbusRegistrar {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            runtime: Handle::current(),
        }
    }
}

impl ClientRegistrar for DbusRegistrar {
    fn register(&self, observer: &Observer) -> Result<(), OperationError> {
        let name = observer.name().to_string();
        WellKnownName::try_from(client_bus_name(&name))
            .map_err(|err| OperationError::invalid_argument(format!("bad client name: {err}")))?;
        ObjectPath::try_from(client_object_path(&name))
            .map_err(|err| OperationError::invalid_argument(format!("bad client path: {err}")))?;

        let connection = self.connection.clone();
        let observer = observer.clone();
        self.runtime.spawn(async move {
            match export_observer(&connection, &observer).await {
                Ok(()) => info!(client = %observer.name(), "observer exported"),
                Err(err) => warn!(client = %observer.name(), ?err, "failed to export observer"),
            }
        });
        Ok(())
    }

    fn unregister(&self, name: &str) {
        let connection = self.connection.clone();
        let name = name.to_string();
        self.runtime.spawn(async move {
            if let Err(err) = withdraw_observer(&connection, &name).await {
                warn!(client = %name, ?err, "failed to withdraw observer");
            }
        });
    }
}
