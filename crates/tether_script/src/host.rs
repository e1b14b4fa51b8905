//! Per-runtime host state shared by the `host.*` entry points
//!
//! Lives on the interpreter's owning thread behind an `Rc`. Tables are
//! `RefCell`s; entry points must not hold a borrow while calling back into
//! script code, since callbacks may re-enter the host.

use rquickjs::{Persistent, Value};
use std::cell::{Cell, RefCell};
use tether_core::{AsyncOperation, CallableHandle, ResultType};
use tether_net::{TcpClient, TcpServer};
use tether_services::download::Downloader;
use tether_services::process::ProcessSpec;
use tether_services::Settings;
use tokio::runtime::Handle;

use crate::ffi::{HandleTable, JsCallable, JsRegistry, ScriptHandle};

/// An operation waiting to be consumed by `taskWait` or `taskRun`.
pub(crate) struct ScriptOperation {
    pub operation: AsyncOperation,
    /// Result type used when the script does not name one.
    pub natural: ResultType,
}

pub(crate) struct BatchProcess {
    pub callback: CallableHandle<JsCallable>,
    pub entries: Vec<BatchEntry>,
}

pub(crate) struct BatchEntry {
    pub spec: ProcessSpec,
    pub on_exit: Option<CallableHandle<JsCallable>>,
}

pub(crate) enum Transport {
    Client(TcpClient),
    Server(TcpServer),
}

pub(crate) struct Connection {
    pub transport: Transport,
    pub on_connect: Option<CallableHandle<JsCallable>>,
    pub on_disconnect: Option<CallableHandle<JsCallable>>,
    pub on_received: Option<CallableHandle<JsCallable>>,
    pub context: Persistent<Value<'static>>,
}

pub(crate) struct HostState {
    pub settings: Settings,
    pub args: Vec<String>,
    pub handle: Handle,
    pub downloader: Downloader,
    pub callables: JsRegistry,
    pub operations: RefCell<HandleTable<ScriptOperation>>,
    pub batches: RefCell<HandleTable<BatchProcess>>,
    pub connections: RefCell<HandleTable<Connection>>,
    pub exit_request: Cell<Option<i32>>,
}

impl HostState {
    pub fn new(settings: Settings, args: Vec<String>, handle: Handle) -> Self {
        Self {
            settings,
            args,
            handle,
            downloader: Downloader::new(),
            callables: JsRegistry::new(),
            operations: RefCell::new(HandleTable::new()),
            batches: RefCell::new(HandleTable::new()),
            connections: RefCell::new(HandleTable::new()),
            exit_request: Cell::new(None),
        }
    }

    pub fn add_operation(&self, operation: AsyncOperation, natural: ResultType) -> ScriptHandle {
        self.operations
            .borrow_mut()
            .insert(ScriptOperation { operation, natural })
    }

    pub fn take_operation(&self, id: ScriptHandle) -> Option<ScriptOperation> {
        self.operations.borrow_mut().remove(id)
    }

    /// Tear down everything that references the interpreter.
    ///
    /// Connections go first so their socket tasks stop feeding events, then
    /// tables, then any callable still parked in the registry.
    pub fn shutdown(&self) {
        let connections = self.connections.borrow_mut().clear();
        let operations = self.operations.borrow_mut().clear();
        let batches = self.batches.borrow_mut().clear();
        let callables = self.callables.release_all();
        tracing::debug!(connections, operations, batches, callables, "host state released");
    }
}
