//! Exported `Client` and `Client.Observer` objects.

use std::collections::HashMap;

use telepathy_core::constants::{CLIENT_BUS_NAME_BASE, CLIENT_OBJECT_PATH_BASE};
use telepathy_core::transport::{property_map_from_zbus, variant_to_zbus};
use telepathy_core::{Client, ObserveChannels, Observer, WeakObserver};
use tracing::{debug, warn};
use zbus::fdo::{RequestNameFlags, RequestNameReply};
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{interface, Connection};

type ChannelDetails = (OwnedObjectPath, HashMap<String, OwnedValue>);

/// `org.freedesktop.Telepathy.Client` on the observer's object.
pub struct ClientServer {
    interfaces: Vec<String>,
}

#[interface(name = "org.freedesktop.Telepathy.Client")]
impl ClientServer {
    #[zbus(property)]
    async fn interfaces(&self) -> Vec<String> {
        self.interfaces.clone()
    }
}

/// `org.freedesktop.Telepathy.Client.Observer` forwarding into the core observer.
pub struct ObserverServer {
    observer: WeakObserver,
    recover: bool,
    delay_approvers: bool,
}

#[interface(name = "org.freedesktop.Telepathy.Client.Observer")]
impl ObserverServer {
    #[zbus(property)]
    async fn observer_channel_filter(&self) -> Vec<HashMap<String, OwnedValue>> {
        let Some(observer) = self.observer.upgrade() else {
            return Vec::new();
        };
        observer
            .filter()
            .iter()
            .map(|spec| {
                spec.properties()
                    .iter()
                    .filter_map(|(name, value)| {
                        variant_to_zbus(value).map(|value| (name.clone(), value))
                    })
                    .collect()
            })
            .collect()
    }

    #[zbus(property)]
    async fn recover(&self) -> bool {
        self.recover
    }

    #[zbus(property)]
    async fn delay_approvers(&self) -> bool {
        self.delay_approvers
    }

    /// Replies only once every channel has a readiness outcome.
    async fn observe_channels(
        &self,
        account: OwnedObjectPath,
        connection: OwnedObjectPath,
        channels: Vec<ChannelDetails>,
        dispatch_operation: OwnedObjectPath,
        requests_satisfied: Vec<OwnedObjectPath>,
        observer_info: HashMap<String, OwnedValue>,
    ) -> zbus::fdo::Result<()> {
        let observer = self
            .observer
            .upgrade()
            .ok_or_else(|| zbus::fdo::Error::Failed("observer is shutting down".to_string()))?;
        debug!(
            client = %observer.name(),
            channels = channels.len(),
            "ObserveChannels received"
        );
        let ack = observer.observe_channels(ObserveChannels {
            account: account.as_str().to_string(),
            connection: connection.as_str().to_string(),
            channels: channels
                .iter()
                .map(|(path, props)| (path.as_str().to_string(), property_map_from_zbus(props)))
                .collect(),
            dispatch_operation: dispatch_operation.as_str().to_string(),
            requests_satisfied: requests_satisfied
                .iter()
                .map(|path| path.as_str().to_string())
                .collect(),
            info: property_map_from_zbus(&observer_info),
        });
        ack.finished()
            .await
            .map_err(|err| zbus::fdo::Error::Failed(err.to_string()))
    }
}

pub fn client_bus_name(name: &str) -> String {
    format!("{CLIENT_BUS_NAME_BASE}{name}")
}

pub fn client_object_path(name: &str) -> String {
    format!("{CLIENT_OBJECT_PATH_BASE}{name}")
}

/// Export `observer` and claim its well-known client name.
pub async fn export_observer(connection: &Connection, observer: &Observer) -> zbus::Result<()> {
    let path = client_object_path(observer.name());
    let settings = observer.settings();
    connection
        .object_server()
        .at(
            path.as_str(),
            ClientServer {
                interfaces: observer.capabilities().interfaces(),
            },
        )
        .await?;
    connection
        .object_server()
        .at(
            path.as_str(),
            ObserverServer {
                observer: observer.downgrade(),
                recover: settings.recover,
                delay_approvers: settings.delay_approvers,
            },
        )
        .await?;

    let bus_name = client_bus_name(observer.name());
    let reply = connection
        .request_name_with_flags(bus_name.as_str(), RequestNameFlags::DoNotQueue.into())
        .await?;
    match reply {
        RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => Ok(()),
        RequestNameReply::InQueue | RequestNameReply::Exists => {
            warn!(bus_name = %bus_name, "client name is already owned");
            Err(zbus::Error::NameTaken)
        }
    }
}

/// Drop the exported objects and release the client name.
pub async fn withdraw_observer(connection: &Connection, name: &str) -> zbus::Result<()> {
    let path = client_object_path(name);
    connection
        .object_server()
        .remove::<ObserverServer, _>(path.as_str())
        .await?;
    connection
        .object_server()
        .remove::<ClientServer, _>(path.as_str())
        .await?;
    connection.release_name(client_bus_name(name).as_str()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_client_conventions() {
        assert_eq!(
            client_bus_name("TpRsSO__1_7_1"),
            "org.freedesktop.Telepathy.Client.TpRsSO__1_7_1"
        );
        assert_eq!(
            client_object_path("TpRsSO__1_7_1"),
            "/org/freedesktop/Telepathy/Client/TpRsSO__1_7_1"
        );
    }
}
