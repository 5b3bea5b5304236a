//! Telepathy interface, property and error names shared across the client.

/// D-Bus properties interface.
pub const IFACE_PROPERTIES: &str = "org.freedesktop.DBus.Properties";

pub const IFACE_CONNECTION: &str = "org.freedesktop.Telepathy.Connection";
pub const IFACE_CONNECTION_INTERFACE_CONTACTS: &str =
    "org.freedesktop.Telepathy.Connection.Interface.Contacts";
pub const IFACE_CHANNEL: &str = "org.freedesktop.Telepathy.Channel";
pub const IFACE_CHANNEL_TYPE_CALL: &str = "org.freedesktop.Telepathy.Channel.Type.Call1";
pub const IFACE_CHANNEL_TYPE_CONTACT_SEARCH: &str =
    "org.freedesktop.Telepathy.Channel.Type.ContactSearch";
pub const IFACE_CHANNEL_TYPE_TEXT: &str = "org.freedesktop.Telepathy.Channel.Type.Text";
pub const IFACE_CHANNEL_INTERFACE_HOLD: &str = "org.freedesktop.Telepathy.Channel.Interface.Hold";
pub const IFACE_CALL_CONTENT: &str = "org.freedesktop.Telepathy.Call1.Content";
pub const IFACE_CLIENT: &str = "org.freedesktop.Telepathy.Client";
pub const IFACE_CLIENT_OBSERVER: &str = "org.freedesktop.Telepathy.Client.Observer";
pub const IFACE_CLIENT_APPROVER: &str = "org.freedesktop.Telepathy.Client.Approver";
pub const IFACE_CLIENT_HANDLER: &str = "org.freedesktop.Telepathy.Client.Handler";

/// Prefix for well-known client bus names.
pub const CLIENT_BUS_NAME_BASE: &str = "org.freedesktop.Telepathy.Client.";
/// Prefix for client object paths.
pub const CLIENT_OBJECT_PATH_BASE: &str = "/org/freedesktop/Telepathy/Client/";

/// Fully qualified immutable channel properties.
pub const PROP_CHANNEL_TYPE: &str = "org.freedesktop.Telepathy.Channel.ChannelType";
pub const PROP_INTERFACES: &str = "org.freedesktop.Telepathy.Channel.Interfaces";
pub const PROP_TARGET_HANDLE_TYPE: &str = "org.freedesktop.Telepathy.Channel.TargetHandleType";
pub const PROP_TARGET_HANDLE: &str = "org.freedesktop.Telepathy.Channel.TargetHandle";
pub const PROP_TARGET_ID: &str = "org.freedesktop.Telepathy.Channel.TargetID";
pub const PROP_REQUESTED: &str = "org.freedesktop.Telepathy.Channel.Requested";
pub const PROP_INITIATOR_ID: &str = "org.freedesktop.Telepathy.Channel.InitiatorID";

/// Attribute carrying the normalized identifier in contact attribute maps.
pub const CONTACT_ID_ATTRIBUTE: &str = "org.freedesktop.Telepathy.Connection/contact-id";

pub const ERROR_CANCELLED: &str = "org.freedesktop.Telepathy.Error.Cancelled";
pub const ERROR_NOT_AVAILABLE: &str = "org.freedesktop.Telepathy.Error.NotAvailable";
pub const ERROR_INVALID_ARGUMENT: &str = "org.freedesktop.Telepathy.Error.InvalidArgument";
pub const ERROR_NOT_IMPLEMENTED: &str = "org.freedesktop.Telepathy.Error.NotImplemented";
pub const ERROR_INVALID_HANDLE: &str = "org.freedesktop.Telepathy.Error.InvalidHandle";
pub const ERROR_NOT_YOURS: &str = "org.freedesktop.Telepathy.Error.NotYours";
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.Telepathy.Error.Disconnected";
/// Used when an operation is finished with an empty error name.
pub const ERROR_HANDLING_ERROR: &str = "org.freedesktop.Telepathy.Client.Error.ErrorHandlingError";
pub const DBUS_ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const DBUS_ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Handle types used in channel class filters.
pub const HANDLE_TYPE_NONE: u32 = 0;
pub const HANDLE_TYPE_CONTACT: u32 = 1;
pub const HANDLE_TYPE_ROOM: u32 = 2;

/// Build a fully qualified property name.
pub fn qualified(interface: &str, property: &str) -> String {
    format!("{interface}.{property}")
}

/// Derive the connection bus name from a connection object path.
///
/// `/org/freedesktop/Telepathy/Connection/gabble/jabber/x` maps to
/// `org.freedesktop.Telepathy.Connection.gabble.jabber.x`.
pub fn connection_bus_name_from_path(path: &str) -> Option<String> {
    let trimmed = path.strip_prefix('/')?;
    if !trimmed.starts_with("org/freedesktop/Telepathy/Connection/") {
        return None;
    }
    Some(trimmed.replace('/', "."))
}

/// Derive the connection object path from its bus name.
pub fn connection_path_from_bus_name(bus_name: &str) -> String {
    format!("/{}", bus_name.replace('.', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_names_map_both_ways() {
        let path = "/org/freedesktop/Telepathy/Connection/gabble/jabber/alice";
        let name = connection_bus_name_from_path(path);
        assert_eq!(
            name.as_deref(),
            Some("org.freedesktop.Telepathy.Connection.gabble.jabber.alice")
        );
        assert_eq!(connection_path_from_bus_name(name.as_deref().unwrap_or("")), path);
        assert!(connection_bus_name_from_path("/org/example/Other").is_none());
    }

    #[test]
    fn qualified_joins_with_dot() {
        assert_eq!(qualified(IFACE_CHANNEL, "ChannelType"), PROP_CHANNEL_TYPE);
    }
}
