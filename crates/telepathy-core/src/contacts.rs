//! Contact identifiers and their resolution through a connection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::constants::{
    connection_path_from_bus_name, CONTACT_ID_ATTRIBUTE, ERROR_INVALID_HANDLE,
    IFACE_CONNECTION_INTERFACE_CONTACTS,
};
use crate::error::OperationError;
use crate::pending::PendingReply;
use crate::proxy::DBusProxy;
use crate::transport::{RemoteBus, Variant};
use crate::util::{lock, log_snippet};

/// A contact known to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Contact {
    /// Normalized identifier.
    pub id: String,
    pub handle: u32,
}

impl Contact {
    pub fn new(id: impl Into<String>, handle: u32) -> Self {
        Self {
            id: id.into(),
            handle,
        }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.id, self.handle)
    }
}

/// Outcome of resolving a batch of identifiers.
///
/// `resolved` keeps the order the identifiers were requested in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedContacts {
    pub resolved: IndexMap<String, Contact>,
    pub invalid: BTreeMap<String, OperationError>,
}

impl ResolvedContacts {
    pub fn contact(&self, identifier: &str) -> Option<&Contact> {
        self.resolved.get(identifier)
    }
}

/// Resolves identifiers to [`Contact`]s.
pub trait ContactManager: Send + Sync {
    fn contacts_for_identifiers(&self, identifiers: Vec<String>) -> PendingReply<ResolvedContacts>;
}

/// Contact manager backed by `Connection.Interface.Contacts`.
pub struct ConnectionContactManager {
    proxy: DBusProxy,
}

impl ConnectionContactManager {
    pub fn new(bus: Arc<dyn RemoteBus>, connection_bus_name: &str) -> Self {
        let path = connection_path_from_bus_name(connection_bus_name);
        Self {
            proxy: DBusProxy::new(bus, connection_bus_name, path),
        }
    }

    pub fn connection_path(&self) -> &str {
        self.proxy.object_path()
    }
}

struct Batch {
    identifiers: Vec<String>,
    outcomes: Vec<Option<Result<Contact, OperationError>>>,
    remaining: usize,
}

impl ContactManager for ConnectionContactManager {
    fn contacts_for_identifiers(&self, identifiers: Vec<String>) -> PendingReply<ResolvedContacts> {
        if identifiers.is_empty() {
            return PendingReply::ready(Ok(ResolvedContacts::default()));
        }
        debug!(count = identifiers.len(), "resolving contact identifiers");

        let result = PendingReply::new();
        let batch = Arc::new(Mutex::new(Batch {
            outcomes: vec![None; identifiers.len()],
            remaining: identifiers.len(),
            identifiers: identifiers.clone(),
        }));

        for (index, identifier) in identifiers.into_iter().enumerate() {
            let reply = self.proxy.call(
                IFACE_CONNECTION_INTERFACE_CONTACTS,
                "GetContactByID",
                vec![Variant::from(identifier.as_str()), Variant::StrList(Vec::new())],
                "ua{sv}",
            );
            let batch = batch.clone();
            let result = result.clone();
            reply.on_reply(move |reply| {
                let outcome = reply.and_then(|args| contact_from_reply(&identifier, args));
                let finished = {
                    let mut batch = lock(&batch);
                    batch.outcomes[index] = Some(outcome);
                    batch.remaining -= 1;
                    if batch.remaining > 0 {
                        return;
                    }
                    collect(&mut batch)
                };
                result.finish(finished);
            });
        }
        result
    }
}

fn contact_from_reply(identifier: &str, args: Vec<Variant>) -> Result<Contact, OperationError> {
    let mut args = args.into_iter();
    let handle = args.next().and_then(|value| value.as_u32()).ok_or_else(|| {
        OperationError::invalid_argument("GetContactByID reply carries no handle")
    })?;
    let id = args
        .next()
        .and_then(|value| {
            value
                .as_map()
                .and_then(|attributes| attributes.get(CONTACT_ID_ATTRIBUTE))
                .and_then(Variant::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| identifier.to_string());
    Ok(Contact { id, handle })
}

fn collect(batch: &mut Batch) -> Result<ResolvedContacts, OperationError> {
    let mut contacts = ResolvedContacts::default();
    let outcomes = std::mem::take(&mut batch.outcomes);
    for (identifier, outcome) in batch.identifiers.iter().zip(outcomes) {
        match outcome {
            Some(Ok(contact)) => {
                contacts.resolved.insert(identifier.clone(), contact);
            }
            Some(Err(error)) if error.name == ERROR_INVALID_HANDLE => {
                debug!(identifier = %log_snippet(identifier), "identifier is invalid");
                contacts.invalid.insert(identifier.clone(), error);
            }
            Some(Err(error)) => {
                warn!(error = %error, "contact resolution failed");
                return Err(error);
            }
            None => {
                return Err(OperationError::cancelled("contact resolution abandoned"));
            }
        }
    }
    Ok(contacts)
}
