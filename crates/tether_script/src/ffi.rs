//! FFI layer between Rust and scripts
//!
//! Handle-based access to host objects, plus the value conversions shared by
//! every `host.*` entry point.

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Exception, FromJs, Function, IntoJs, Persistent, TypedArray, Value};
use std::collections::HashMap;
use std::fmt;
use tether_core::{CallableHandle, CallableRegistry, OperationValue, Payload};

/// A script function parked outside the interpreter's stack.
pub type JsCallable = Persistent<Function<'static>>;

pub type JsRegistry = CallableRegistry<JsCallable>;

/// Opaque integer handle for script access to a host object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptHandle(pub u32);

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'js> FromJs<'js> for ScriptHandle {
    fn from_js(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Self> {
        let raw = f64::from_js(ctx, value)?;
        if raw.fract() != 0.0 || raw < 0.0 || raw > f64::from(u32::MAX) {
            return Err(rquickjs::Error::new_from_js("number", "handle"));
        }
        Ok(ScriptHandle(raw as u32))
    }
}

impl<'js> IntoJs<'js> for ScriptHandle {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        f64::from(self.0).into_js(ctx)
    }
}

/// Host objects addressed from scripts by [`ScriptHandle`].
///
/// Ids start at 1 and are not reused within one runtime.
#[derive(Debug)]
pub struct HandleTable<T> {
    next: u32,
    entries: HashMap<ScriptHandle, T>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> ScriptHandle {
        let handle = ScriptHandle(self.next);
        self.next = self.next.wrapping_add(1).max(1);
        self.entries.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: ScriptHandle) -> Option<&T> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ScriptHandle) -> Option<&mut T> {
        self.entries.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: ScriptHandle) -> Option<T> {
        self.entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        cleared
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Park `func` in `registry`.
pub fn park<'js>(ctx: &Ctx<'js>, registry: &JsRegistry, func: Function<'js>) -> CallableHandle<JsCallable> {
    registry.register(Persistent::save(ctx, func))
}

/// Throw a script `Error` carrying `message`.
pub fn throw(ctx: &Ctx<'_>, message: impl fmt::Display) -> rquickjs::Error {
    Exception::throw_message(ctx, &message.to_string())
}

/// Turn an interpreter error into a plain message, consuming any pending
/// exception.
pub fn error_message(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !err.is_exception() {
        return err.to_string();
    }
    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    thrown
        .get::<Coerced<String>>()
        .map(|text| text.0)
        .unwrap_or_else(|_| "uncaught exception".to_string())
}

/// `Some` converts as usual, `None` becomes `null`.
pub fn nullable<'js, T: IntoJs<'js>>(ctx: &Ctx<'js>, value: Option<T>) -> rquickjs::Result<Value<'js>> {
    match value {
        Some(value) => value.into_js(ctx),
        None => Ok(Value::new_null(ctx.clone())),
    }
}

/// Convert a decoded operation value for delivery. `None` becomes
/// `undefined`.
pub fn operation_value_to_js<'js>(ctx: &Ctx<'js>, value: Option<OperationValue>) -> rquickjs::Result<Value<'js>> {
    match value {
        None | Some(OperationValue::Void) => Ok(Value::new_undefined(ctx.clone())),
        Some(OperationValue::Int(v)) => v.into_js(ctx),
        Some(OperationValue::Long(v)) => (v as f64).into_js(ctx),
        Some(OperationValue::Float(v)) => f64::from(v).into_js(ctx),
        Some(OperationValue::Double(v)) => v.into_js(ctx),
        Some(OperationValue::Bool(v)) => v.into_js(ctx),
        Some(OperationValue::Str(v)) => v.into_js(ctx),
    }
}

/// Bytes become a `Uint8Array`, text a string.
pub fn payload_to_js<'js>(ctx: &Ctx<'js>, payload: Payload) -> rquickjs::Result<Value<'js>> {
    match payload {
        Payload::Bytes(bytes) => TypedArray::<u8>::new(ctx.clone(), bytes)?.into_js(ctx),
        Payload::Text(text) => text.into_js(ctx),
    }
}

/// Accept a string, a `Uint8Array`, or an array of byte values.
pub fn payload_from_js<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Vec<u8>> {
    if let Some(text) = value.as_string() {
        return Ok(text.to_string()?.into_bytes());
    }
    if let Ok(typed) = TypedArray::<u8>::from_js(ctx, value.clone()) {
        if let Some(bytes) = typed.as_bytes() {
            return Ok(bytes.to_vec());
        }
    }
    Vec::<u8>::from_js(ctx, value)
}
