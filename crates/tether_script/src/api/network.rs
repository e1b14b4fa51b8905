//! TCP transports and HTTP downloads

use rquickjs::convert::Coerced;
use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Function, IntoJs, Object, Persistent, Value};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tether_core::{CallableHandle, ConnectionEvent, ConnectionId, EventBridge, Payload, PayloadKind, ResultType};
use tether_net::{TcpClient, TcpServer, TransportConfig, TransportError};
use tether_services::download::{HttpRequest, RequestBody};

use super::{count_arg, optional};
use super::system::exit_error;
use crate::ffi::{self, JsCallable, ScriptHandle};
use crate::host::{Connection, HostState, Transport};

pub(super) fn register<'js>(host: &Object<'js>, state: &Rc<HostState>) -> rquickjs::Result<()> {
    host.set("TCP_BYTES", i32::from(PayloadKind::Bytes.tag()))?;
    host.set("TCP_TEXT", i32::from(PayloadKind::Text.tag()))?;

    let st = Rc::clone(state);
    host.set(
        "tcpClientStart",
        Func::from(move |ctx: Ctx<'js>, config: Object<'js>| start(ctx, &st, config, false)),
    )?;

    let st = Rc::clone(state);
    host.set(
        "tcpServerStart",
        Func::from(move |ctx: Ctx<'js>, config: Object<'js>| start(ctx, &st, config, true)),
    )?;

    let st = Rc::clone(state);
    host.set(
        "tcpClientSend",
        Func::from(
            move |ctx: Ctx<'js>, handle: ScriptHandle, tag: f64, payload: Value<'js>| {
                send(&ctx, &st, handle, None, tag, payload)
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "tcpServerSend",
        Func::from(
            move |ctx: Ctx<'js>, handle: ScriptHandle, endpoint: String, tag: f64, payload: Value<'js>| {
                send(&ctx, &st, handle, Some(ConnectionId::new(endpoint)), tag, payload)
            },
        ),
    )?;

    let st = Rc::clone(state);
    host.set(
        "tcpDispose",
        Func::from(move |handle: ScriptHandle| {
            let removed = st.connections.borrow_mut().remove(handle);
            removed.is_some()
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "tcpPumpEvents",
        Func::from(move |ctx: Ctx<'js>, handle: ScriptHandle| pump_events(ctx, &st, handle)),
    )?;

    let st = Rc::clone(state);
    host.set(
        "tcpServerEndpoint",
        Func::from(move |ctx: Ctx<'js>, handle: ScriptHandle| -> rquickjs::Result<Value<'js>> {
            let connections = st.connections.borrow();
            match connections.get(handle).map(|conn| &conn.transport) {
                Some(Transport::Server(server)) => server.local_addr().to_string().into_js(&ctx),
                _ => Ok(Value::new_null(ctx.clone())),
            }
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "httpDownload",
        Func::from(move |url: String, path: String| {
            let operation = st.downloader.spawn(&st.handle, url, PathBuf::from(path));
            st.add_operation(operation, ResultType::Void)
        }),
    )?;

    let st = Rc::clone(state);
    host.set(
        "httpRequest",
        Func::from(
            move |ctx: Ctx<'js>,
                  url: String,
                  method: String,
                  body: Opt<Option<Value<'js>>>,
                  headers: Opt<Option<Object<'js>>>,
                  binary: Opt<Option<bool>>| {
                http_request(ctx, &st, url, method, optional(body), optional(headers), optional(binary))
            },
        ),
    )?;
    Ok(())
}

/// Blocking request. Returns the response body as text, or as a
/// `Uint8Array` when `binary` is set. Error statuses still return their
/// body; transport failures throw.
fn http_request<'js>(
    ctx: Ctx<'js>,
    state: &HostState,
    url: String,
    method: String,
    body: Option<Value<'js>>,
    headers: Option<Object<'js>>,
    binary: Option<bool>,
) -> rquickjs::Result<Value<'js>> {
    let mut request = HttpRequest::new(method, url);
    if let Some(headers) = headers {
        for header in headers.props::<String, Coerced<String>>() {
            let (name, value) = header?;
            request = request.header(name, value.0);
        }
    }
    match body {
        Some(body) if body.is_string() => {
            let text: String = body.get()?;
            request = request.body(RequestBody::Text(text));
        }
        Some(body) if !body.is_null() && !body.is_undefined() => {
            request = request.body(RequestBody::Bytes(ffi::payload_from_js(&ctx, body)?));
        }
        _ => {}
    }

    let response = state
        .downloader
        .request(&state.handle, request)
        .map_err(|err| ffi::throw(&ctx, err))?;
    tracing::debug!(status = response.status, "script http request answered");
    let payload = if binary.unwrap_or(false) {
        Payload::Bytes(response.body)
    } else {
        Payload::Text(String::from_utf8_lossy(&response.body).into_owned())
    };
    ffi::payload_to_js(&ctx, payload)
}

/// Start a client or server from a script config object. Returns the
/// connection handle, or `null` when the transport could not start.
fn start<'js>(ctx: Ctx<'js>, state: &HostState, config: Object<'js>, server: bool) -> rquickjs::Result<Value<'js>> {
    let endpoint: String = config.get("endpoint")?;
    let buffer_size: Option<f64> = config.get("bufferSize")?;
    let no_delay: Option<bool> = config.get("noDelay")?;
    let on_connect: Option<Function<'js>> = config.get("onConnect")?;
    let on_disconnect: Option<Function<'js>> = config.get("onDisconnect")?;
    let on_received: Option<Function<'js>> = config.get("onReceived")?;
    let context: Value<'js> = config.get("context")?;

    let network = &state.settings.network;
    let mut transport_config = TransportConfig::new(endpoint);
    transport_config.buffer_size = count_arg(&ctx, "bufferSize", buffer_size, network.default_buffer_size)?;
    transport_config.no_delay = no_delay.unwrap_or(network.no_delay);
    transport_config.max_frame_len = network.max_frame_len;

    let transport = if server {
        TcpServer::bind(&state.handle, &transport_config).map(Transport::Server)
    } else {
        TcpClient::connect(&state.handle, &transport_config).map(Transport::Client)
    };
    let transport = match transport {
        Ok(transport) => transport,
        Err(err) => {
            tracing::error!(endpoint = %transport_config.endpoint, %err, "transport failed to start");
            return Ok(Value::new_null(ctx));
        }
    };

    let park = |func: Function<'js>| ffi::park(&ctx, &state.callables, func);
    let id = state.connections.borrow_mut().insert(Connection {
        transport,
        on_connect: on_connect.map(park),
        on_disconnect: on_disconnect.map(park),
        on_received: on_received.map(park),
        context: Persistent::save(&ctx, context),
    });
    tracing::debug!(connection = %id, server, "connection handle created");
    id.into_js(&ctx)
}

fn send<'js>(
    ctx: &Ctx<'js>,
    state: &HostState,
    handle: ScriptHandle,
    endpoint: Option<ConnectionId>,
    tag: f64,
    payload: Value<'js>,
) -> rquickjs::Result<bool> {
    let kind = (tag.fract() == 0.0 && (0.0..=255.0).contains(&tag))
        .then(|| PayloadKind::from_tag(tag as u8))
        .flatten();
    let Some(kind) = kind else {
        return Err(ffi::throw(ctx, format!("unknown payload tag {tag}")));
    };
    let bytes = ffi::payload_from_js(ctx, payload)?;

    let connections = state.connections.borrow();
    let Some(conn) = connections.get(handle) else {
        tracing::warn!(connection = %handle, "send on unknown connection");
        return Ok(false);
    };
    let sent: Result<bool, TransportError> = match (&conn.transport, &endpoint) {
        (Transport::Client(client), None) => client.send(kind.tag(), &bytes),
        (Transport::Server(server), Some(endpoint)) => server.send(endpoint, kind.tag(), &bytes),
        (Transport::Client(_), Some(_)) | (Transport::Server(_), None) => {
            tracing::warn!(connection = %handle, "send used the wrong transport kind");
            Ok(false)
        }
    };
    sent.map_err(|err| ffi::throw(ctx, err))
}

/// Callables and bridge of one connection, cloned out of the table so no
/// borrow is held while script code runs.
struct PumpTarget {
    bridge: Arc<EventBridge>,
    server: bool,
    on_connect: Option<JsCallable>,
    on_disconnect: Option<JsCallable>,
    on_received: Option<JsCallable>,
    context: Persistent<Value<'static>>,
}

fn pump_target(conn: &Connection) -> PumpTarget {
    let (bridge, server) = match &conn.transport {
        Transport::Client(client) => (Arc::clone(client.bridge()), false),
        Transport::Server(server) => (Arc::clone(server.bridge()), true),
    };
    PumpTarget {
        bridge,
        server,
        on_connect: conn.on_connect.as_ref().and_then(CallableHandle::get),
        on_disconnect: conn.on_disconnect.as_ref().and_then(CallableHandle::get),
        on_received: conn.on_received.as_ref().and_then(CallableHandle::get),
        context: conn.context.clone(),
    }
}

/// Deliver every queued event of one connection. Returns how many were
/// delivered.
fn pump_events(ctx: Ctx<'_>, state: &HostState, handle: ScriptHandle) -> rquickjs::Result<f64> {
    let target = {
        let connections = state.connections.borrow();
        let Some(conn) = connections.get(handle) else {
            return Err(ffi::throw(&ctx, format!("unknown connection {handle}")));
        };
        pump_target(conn)
    };

    let restore = |parked: Option<JsCallable>| parked.map(|p| p.restore(&ctx)).transpose();
    let on_connect = restore(target.on_connect)?;
    let on_disconnect = restore(target.on_disconnect)?;
    let on_received = restore(target.on_received)?;
    let context = target.context.restore(&ctx)?;

    let report = target.bridge.dispatch(|id, event| {
        let (func, payload) = match event {
            ConnectionEvent::Connected => (&on_connect, None),
            ConnectionEvent::Disconnected => (&on_disconnect, None),
            ConnectionEvent::Received(payload) => (&on_received, Some(payload)),
        };
        let Some(func) = func else {
            return Ok(());
        };
        let endpoint = target.server.then_some(id);
        invoke(&ctx, func, context.clone(), endpoint, payload).map_err(|err| ffi::error_message(&ctx, err))
    });

    if let Some(code) = state.exit_request.get() {
        return Err(exit_error(&ctx, code));
    }
    Ok(report.delivered as f64)
}

/// Call a connection callback as `(context, endpoint?, payload?)`. The
/// endpoint is only passed for server connections.
fn invoke<'js>(
    ctx: &Ctx<'js>,
    func: &Function<'js>,
    context: Value<'js>,
    endpoint: Option<&ConnectionId>,
    payload: Option<Payload>,
) -> rquickjs::Result<()> {
    let payload = payload.map(|payload| ffi::payload_to_js(ctx, payload)).transpose()?;
    match (endpoint, payload) {
        (Some(endpoint), Some(payload)) => func.call((context, endpoint.as_str(), payload)),
        (Some(endpoint), None) => func.call((context, endpoint.as_str())),
        (None, Some(payload)) => func.call((context, payload)),
        (None, None) => func.call((context,)),
    }
}
