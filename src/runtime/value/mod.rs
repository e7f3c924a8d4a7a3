//! Runtime value surface for the concurrency core
//!
//! This module implements the minimal `Value` representation the scheduler,
//! channels and streams operate on. The host language's full tagged-union
//! encoding lives outside this crate; here a value is either a primitive, a
//! small immutable composite, or a handle to a concurrency object.
//!
//! Threaded channels cannot share `Rc`-backed handles across collector/thread
//! boundaries, so values crossing threads are packed into a self-contained
//! [`PackedValue`]: primitives, strings and bytes cross unpacked, composites
//! are serialized on send and deserialized on receive.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::runtime::channel::{Channel, ThreadedChannel};
use crate::runtime::errors::{RuntimeError, RuntimeResult};
use crate::runtime::fiber::FiberHandle;
use crate::runtime::stream::StreamHandle;


/// Runtime value - the surface the concurrency core exchanges.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Empty value
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Immutable byte buffer
    Bytes(Arc<[u8]>),
    /// Immutable tuple
    Tuple(Arc<[Value]>),
    /// A fiber handle (loop-local)
    Fiber(FiberHandle),
    /// A channel handle
    Channel(Channel),
    /// A stream handle (loop-local)
    Stream(StreamHandle),
}

impl Value {
    /// Build a string value.
    #[inline]
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Build a bytes value.
    #[inline]
    pub fn bytes(b: impl AsRef<[u8]>) -> Self {
        Value::Bytes(Arc::from(b.as_ref()))
    }

    /// Build a tuple value.
    #[inline]
    pub fn tuple(items: impl Into<Vec<Value>>) -> Self {
        Value::Tuple(Arc::from(items.into()))
    }

    /// Human-readable type name, used in errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Fiber(_) => "fiber",
            Value::Channel(_) => "channel",
            Value::Stream(_) => "stream",
        }
    }

    /// True for `Nil`.
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Pack this value for a cross-thread hand-off.
    ///
    /// Primitives, strings and bytes cross directly. Tuples are serialized
    /// into a self-contained buffer. Fibers, streams and local channels are
    /// bound to their owning loop and cannot cross; threaded channels can.
    pub fn pack(&self) -> RuntimeResult<PackedValue> {
        Ok(match self {
            Value::Nil => PackedValue::Nil,
            Value::Bool(b) => PackedValue::Bool(*b),
            Value::Int(i) => PackedValue::Int(*i),
            Value::Float(f) => PackedValue::Float(*f),
            Value::Str(s) => PackedValue::Str(s.clone()),
            Value::Bytes(b) => PackedValue::Bytes(b.clone()),
            Value::Tuple(_) => {
                let wire = WireValue::from_value(self)?;
                let buf = serde_json::to_vec(&wire)
                    .map_err(|e| RuntimeError::MalformedPayload(e.to_string()))?;
                PackedValue::Packed(buf)
            }
            Value::Channel(c) => match c.threaded_core() {
                Some(core) => PackedValue::Channel(core),
                None => return Err(RuntimeError::NotSendable("channel")),
            },
            other => return Err(RuntimeError::NotSendable(other.type_name())),
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Fiber(a), Value::Fiber(b)) => a.ptr_eq(b),
            (Value::Channel(a), Value::Channel(b)) => a.ptr_eq(b),
            (Value::Stream(a), Value::Stream(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<bytes:{}>", b.len()),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Value::Fiber(h) => write!(f, "{h:?}"),
            Value::Channel(c) => write!(f, "{c:?}"),
            Value::Stream(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v.as_str()))
    }
}

/// A value packed for crossing an OS-thread boundary.
///
/// Self-contained: no `Rc`, no loop-bound handles. Unpacking on the receiving
/// loop reconstructs an equivalent [`Value`].
#[derive(Debug, Clone)]
pub enum PackedValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    /// Serialized composite (tuple) payload.
    Packed(Vec<u8>),
    /// Threaded channels are shared, not copied.
    Channel(Arc<ThreadedChannel>),
}

impl PackedValue {
    /// Reconstruct a [`Value`] on the receiving loop.
    pub fn unpack(self) -> RuntimeResult<Value> {
        Ok(match self {
            PackedValue::Nil => Value::Nil,
            PackedValue::Bool(b) => Value::Bool(b),
            PackedValue::Int(i) => Value::Int(i),
            PackedValue::Float(f) => Value::Float(f),
            PackedValue::Str(s) => Value::Str(s),
            PackedValue::Bytes(b) => Value::Bytes(b),
            PackedValue::Packed(buf) => {
                let wire: WireValue = serde_json::from_slice(&buf)
                    .map_err(|e| RuntimeError::MalformedPayload(e.to_string()))?;
                wire.into_value()
            }
            PackedValue::Channel(core) => Value::Channel(Channel::from_threaded(core)),
        })
    }
}

/// Serialized form of composite values.
#[derive(Debug, Serialize, Deserialize)]
enum WireValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<WireValue>),
}

impl WireValue {
    fn from_value(v: &Value) -> RuntimeResult<Self> {
        Ok(match v {
            Value::Nil => WireValue::Nil,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.to_string()),
            Value::Bytes(b) => WireValue::Bytes(b.to_vec()),
            Value::Tuple(items) => WireValue::Tuple(
                items
                    .iter()
                    .map(WireValue::from_value)
                    .collect::<RuntimeResult<Vec<_>>>()?,
            ),
            other => return Err(RuntimeError::NotSendable(other.type_name())),
        })
    }

    fn into_value(self) -> Value {
        match self {
            WireValue::Nil => Value::Nil,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::from(s),
            WireValue::Bytes(b) => Value::bytes(b),
            WireValue::Tuple(items) => Value::tuple(
                items.into_iter().map(WireValue::into_value).collect::<Vec<_>>(),
            ),
        }
    }
}
