//! D-Bus transport over zbus.
//!
//! Calls and signal streams run as tokio tasks; every reply and signal is then
//! handed to one dispatcher task so that proxy callbacks never run
//! concurrently with each other. A call waits until every signal subscribed
//! before it has its match rule installed, so a fetch issued right after
//! connecting a change signal cannot miss a change emitted in between.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use zbus::zvariant::{Array, ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, Message};

use super::{
    MethodCall, PropertyMap, RemoteBus, SignalHandler, SignalMatch, SignalSubscription, Variant,
};
use crate::constants::{DBUS_ERROR_FAILED, DBUS_ERROR_NO_REPLY};
use crate::error::OperationError;
use crate::pending::PendingReply;
use crate::util::log_snippet;

type Dispatch = Box<dyn FnOnce() + Send>;
type Reason = (u32, u32, String, String);
type ContactInfo = Vec<(String, Vec<String>, Vec<String>)>;

/// [`RemoteBus`] backed by a zbus connection.
pub struct ZbusBus {
    connection: Connection,
    call_timeout: Duration,
    dispatcher: mpsc::UnboundedSender<Dispatch>,
    runtime: Handle,
    setups: SetupBarrier,
}

impl ZbusBus {
    /// Wrap an existing connection. Must be called from within a tokio runtime.
    pub fn new(connection: Connection, call_timeout: Duration) -> Arc<Self> {
        let (dispatcher, mut receiver) = mpsc::unbounded_channel::<Dispatch>();
        let runtime = Handle::current();
        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                job();
            }
        });
        Arc::new(Self {
            connection,
            call_timeout,
            dispatcher,
            runtime,
            setups: SetupBarrier::new(),
        })
    }

    pub async fn session(call_timeout: Duration) -> zbus::Result<Arc<Self>> {
        Ok(Self::new(Connection::session().await?, call_timeout))
    }

    pub async fn system(call_timeout: Duration) -> zbus::Result<Arc<Self>> {
        Ok(Self::new(Connection::system().await?, call_timeout))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl RemoteBus for ZbusBus {
    fn unique_name(&self) -> String {
        self.connection
            .unique_name()
            .map(|name| name.to_string())
            .unwrap_or_default()
    }

    fn call(&self, call: MethodCall) -> PendingReply<Vec<Variant>> {
        let reply = PendingReply::new();
        let out = reply.clone();
        let connection = self.connection.clone();
        let dispatcher = self.dispatcher.clone();
        let timeout = self.call_timeout;
        let setups = self.setups.clone();
        self.runtime.spawn(async move {
            let ordered = async {
                setups.wait().await;
                invoke(&connection, &call).await
            };
            let result = match tokio::time::timeout(timeout, ordered).await {
                Ok(result) => result,
                Err(_) => Err(OperationError::new(
                    DBUS_ERROR_NO_REPLY,
                    format!("{}.{} timed out", call.interface, call.member),
                )),
            };
            if let Err(err) = &result {
                debug!(
                    member = %call.member,
                    path = %call.path,
                    error = %log_snippet(&err.to_string()),
                    "method call failed"
                );
            }
            let _ = dispatcher.send(Box::new(move || {
                out.finish(result);
            }));
        });
        reply
    }

    fn subscribe(&self, rule: SignalMatch, handler: SignalHandler) -> SignalSubscription {
        let connection = self.connection.clone();
        let dispatcher = self.dispatcher.clone();
        // Taken before spawning so calls issued after this returns are held.
        let setup = self.setups.begin();
        let task = self.runtime.spawn(async move {
            let proxy = match zbus::Proxy::new(
                &connection,
                rule.sender.clone(),
                rule.path.clone(),
                rule.interface.clone(),
            )
            .await
            {
                Ok(proxy) => proxy,
                Err(err) => {
                    warn!(?err, member = %rule.member, "failed to create signal proxy");
                    return;
                }
            };
            let mut stream = match proxy.receive_signal(rule.member.clone()).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(?err, member = %rule.member, "failed to subscribe to signal");
                    return;
                }
            };
            // Match rule is active; release waiting calls.
            drop(setup);
            while let Some(message) = stream.next().await {
                match decode_body(&message, rule.signature) {
                    Ok(args) => {
                        let handler = handler.clone();
                        if dispatcher.send(Box::new(move || handler(args))).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(member = %rule.member, error = %err, "dropping undecodable signal");
                    }
                }
            }
        });
        SignalSubscription::new(move || task.abort())
    }
}

/// Counts subscriptions whose match rule is not installed yet.
#[derive(Clone)]
struct SetupBarrier {
    pending: Arc<watch::Sender<usize>>,
}

impl SetupBarrier {
    fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            pending: Arc::new(pending),
        }
    }

    fn begin(&self) -> SetupGuard {
        self.pending.send_modify(|count| *count += 1);
        SetupGuard {
            pending: self.pending.clone(),
        }
    }

    async fn wait(&self) {
        let mut pending = self.pending.subscribe();
        // The sender lives as long as `self`, so this only returns at zero.
        let _ = pending.wait_for(|count| *count == 0).await;
    }
}

/// Held by a subscription task until its rule is installed, or the task
/// gives up or is aborted.
struct SetupGuard {
    pending: Arc<watch::Sender<usize>>,
}

impl Drop for SetupGuard {
    fn drop(&mut self) {
        self.pending
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

async fn invoke(connection: &Connection, call: &MethodCall) -> Result<Vec<Variant>, OperationError> {
    let message = send_call(connection, call).await.map_err(map_zbus_error)?;
    decode_body(&message, call.reply_signature)
}

async fn send_call(connection: &Connection, call: &MethodCall) -> zbus::Result<Message> {
    let destination = Some(call.destination.as_str());
    let path = call.path.as_str();
    let interface = Some(call.interface.as_str());
    let member = call.member.as_str();
    match call.args.as_slice() {
        [] => {
            connection
                .call_method(destination, path, interface, member, &())
                .await
        }
        [Variant::Bool(flag)] => {
            connection
                .call_method(destination, path, interface, member, &(*flag,))
                .await
        }
        [Variant::Str(first)] => {
            connection
                .call_method(destination, path, interface, member, &(first.as_str(),))
                .await
        }
        [Variant::Str(first), Variant::Str(second)] => {
            connection
                .call_method(
                    destination,
                    path,
                    interface,
                    member,
                    &(first.as_str(), second.as_str()),
                )
                .await
        }
        [Variant::Str(first), Variant::StrList(list)] => {
            connection
                .call_method(destination, path, interface, member, &(first.as_str(), list))
                .await
        }
        [Variant::Map(terms)] => {
            // Only string dictionaries (a{ss}) are sent by the client.
            let terms: HashMap<&str, &str> = terms
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|value| (key.as_str(), value)))
                .collect();
            connection
                .call_method(destination, path, interface, member, &(terms,))
                .await
        }
        other => Err(zbus::Error::Failure(format!(
            "unsupported argument shape for {}: {} args",
            call.member,
            other.len()
        ))),
    }
}

fn map_zbus_error(err: zbus::Error) -> OperationError {
    match err {
        zbus::Error::MethodError(name, message, _) => {
            OperationError::new(name.to_string(), message.unwrap_or_default())
        }
        other => OperationError::new(DBUS_ERROR_FAILED, other.to_string()),
    }
}

fn decode_error(err: zbus::Error) -> OperationError {
    OperationError::new(DBUS_ERROR_FAILED, format!("failed to decode message body: {err}"))
}

/// Decode a message body with a known signature into detached values.
fn decode_body(message: &Message, signature: &str) -> Result<Vec<Variant>, OperationError> {
    let body = message.body();
    let args = match signature {
        "" => Vec::new(),
        "a{sv}" => {
            let map: HashMap<String, OwnedValue> = body.deserialize().map_err(decode_error)?;
            vec![Variant::Map(convert_map(&map))]
        }
        "v" => {
            let value: OwnedValue = body.deserialize().map_err(decode_error)?;
            vec![convert_value(&value)]
        }
        "o" => {
            let path: OwnedObjectPath = body.deserialize().map_err(decode_error)?;
            vec![Variant::ObjectPath(path.as_str().to_string())]
        }
        "uu" => {
            let (first, second): (u32, u32) = body.deserialize().map_err(decode_error)?;
            vec![Variant::from(first), Variant::from(second)]
        }
        "ua{sv}" => {
            let (handle, map): (u32, HashMap<String, OwnedValue>) =
                body.deserialize().map_err(decode_error)?;
            vec![Variant::from(handle), Variant::Map(convert_map(&map))]
        }
        "o(uuss)" => {
            let (path, reason): (OwnedObjectPath, Reason) =
                body.deserialize().map_err(decode_error)?;
            vec![
                Variant::ObjectPath(path.as_str().to_string()),
                reason_variant(reason),
            ]
        }
        "uu(uuss)a{sv}" => {
            let (state, flags, reason, details): (u32, u32, Reason, HashMap<String, OwnedValue>) =
                body.deserialize().map_err(decode_error)?;
            vec![
                Variant::from(state),
                Variant::from(flags),
                reason_variant(reason),
                Variant::Map(convert_map(&details)),
            ]
        }
        "usa{sv}" => {
            let (state, error, details): (u32, String, HashMap<String, OwnedValue>) =
                body.deserialize().map_err(decode_error)?;
            vec![
                Variant::from(state),
                Variant::Str(error),
                Variant::Map(convert_map(&details)),
            ]
        }
        "a{sa(sasas)}" => {
            let results: HashMap<String, ContactInfo> = body.deserialize().map_err(decode_error)?;
            let map = results
                .into_iter()
                .map(|(identifier, fields)| (identifier, contact_info_variant(fields)))
                .collect();
            vec![Variant::Map(map)]
        }
        other => {
            return Err(OperationError::new(
                DBUS_ERROR_FAILED,
                format!("unsupported body signature {other}"),
            ))
        }
    };
    Ok(args)
}

fn reason_variant((actor, reason, dbus_reason, message): Reason) -> Variant {
    Variant::List(vec![
        Variant::from(actor),
        Variant::from(reason),
        Variant::Str(dbus_reason),
        Variant::Str(message),
    ])
}

fn contact_info_variant(fields: ContactInfo) -> Variant {
    Variant::List(
        fields
            .into_iter()
            .map(|(name, parameters, values)| {
                Variant::List(vec![
                    Variant::Str(name),
                    Variant::StrList(parameters),
                    Variant::StrList(values),
                ])
            })
            .collect(),
    )
}

/// Detach an `a{sv}` received by an exported object.
pub fn property_map_from_zbus(map: &HashMap<String, OwnedValue>) -> PropertyMap {
    convert_map(map)
}

/// Encode a detached value for an exported property; `None` for shapes that
/// have no single wire form.
pub fn variant_to_zbus(value: &Variant) -> Option<OwnedValue> {
    let value = match value {
        Variant::Bool(flag) => Value::from(*flag),
        Variant::UInt(number) => match u32::try_from(*number) {
            Ok(number) => Value::from(number),
            Err(_) => Value::from(*number),
        },
        Variant::Int(number) => match i32::try_from(*number) {
            Ok(number) => Value::from(number),
            Err(_) => Value::from(*number),
        },
        Variant::Double(number) => Value::from(*number),
        Variant::Str(text) => Value::from(text.clone()),
        Variant::StrList(list) => Value::from(list.clone()),
        Variant::ObjectPath(path) => Value::from(ObjectPath::try_from(path.clone()).ok()?),
        Variant::ObjectPathList(paths) => {
            let paths = paths
                .iter()
                .map(|path| ObjectPath::try_from(path.clone()).ok())
                .collect::<Option<Vec<_>>>()?;
            Value::from(paths)
        }
        Variant::Map(_) | Variant::List(_) | Variant::Unsupported => return None,
    };
    OwnedValue::try_from(value).ok()
}

fn convert_map(map: &HashMap<String, OwnedValue>) -> PropertyMap {
    map.iter()
        .map(|(key, value)| (key.clone(), convert_value(value)))
        .collect()
}

fn convert_value(value: &Value<'_>) -> Variant {
    match value {
        Value::Bool(flag) => Variant::Bool(*flag),
        Value::U8(number) => Variant::UInt(u64::from(*number)),
        Value::U16(number) => Variant::UInt(u64::from(*number)),
        Value::U32(number) => Variant::UInt(u64::from(*number)),
        Value::U64(number) => Variant::UInt(*number),
        Value::I16(number) => Variant::Int(i64::from(*number)),
        Value::I32(number) => Variant::Int(i64::from(*number)),
        Value::I64(number) => Variant::Int(*number),
        Value::F64(number) => Variant::Double(*number),
        Value::Str(text) => Variant::Str(text.as_str().to_string()),
        Value::ObjectPath(path) => Variant::ObjectPath(path.as_str().to_string()),
        Value::Value(inner) => convert_value(inner),
        Value::Array(array) => convert_array(array),
        Value::Structure(structure) => {
            Variant::List(structure.fields().iter().map(convert_value).collect())
        }
        // Nested dictionaries and fds are not read by any proxy.
        _ => Variant::Unsupported,
    }
}

fn convert_array(array: &Array<'_>) -> Variant {
    let elements: Vec<Variant> = array.inner().iter().map(convert_value).collect();
    if elements.is_empty() {
        return Variant::List(elements);
    }
    if elements
        .iter()
        .all(|element| matches!(element, Variant::ObjectPath(_)))
    {
        return Variant::ObjectPathList(
            elements
                .into_iter()
                .filter_map(|element| element.as_object_path().map(str::to_string))
                .collect(),
        );
    }
    if elements.iter().all(|element| matches!(element, Variant::Str(_))) {
        return Variant::StrList(
            elements
                .into_iter()
                .filter_map(|element| element.as_str().map(str::to_string))
                .collect(),
        );
    }
    Variant::List(elements)
}
