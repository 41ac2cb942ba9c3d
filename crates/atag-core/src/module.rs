//! The surface of a native detection module as seen from the host.
//!
//! A module is opaque: the host can look up exports by name, call them with
//! positional numeric arguments, and read or write its linear memory. Nothing
//! else about it is known, which is why the calling convention has to be
//! discovered at runtime (see [`crate::probe`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A numeric argument or return value crossing the module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    I32(i32),
    F64(f64),
}

impl Value {
    /// Numeric value widened to `f64`.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::I32(v) => v as f64,
            Value::F64(v) => v,
        }
    }

    /// Interpret the value as a detection count.
    ///
    /// Returns `None` for negative or non-finite values, which the module uses
    /// to signal errors.
    pub fn as_count(&self) -> Option<u32> {
        match *self {
            Value::I32(v) if v >= 0 => Some(v as u32),
            Value::I32(_) => None,
            Value::F64(v) if v.is_finite() && v >= 0.0 => Some(v.trunc().min(u32::MAX as f64) as u32),
            Value::F64(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

/// Kind of an entry in the module's export table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Function,
    Memory,
    Global,
}

/// Fault raised by the module while executing a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Trap {
    pub message: String,
}

impl Trap {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A loaded native detection module.
///
/// Implementations wrap whatever runtime hosts the module. Calls take `&mut
/// self`: the module is not reentrant, so at most one call may be in flight.
pub trait NativeModule {
    /// Look up an export by name.
    fn export_kind(&self, name: &str) -> Option<ExportKind>;

    /// Call a function export with positional arguments.
    ///
    /// `Ok(None)` means the function returned nothing.
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, Trap>;

    /// The module's linear memory.
    fn memory(&mut self) -> &mut [u8];
}

impl<M: NativeModule + ?Sized> NativeModule for Box<M> {
    fn export_kind(&self, name: &str) -> Option<ExportKind> {
        (**self).export_kind(name)
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, Trap> {
        (**self).call(name, args)
    }

    fn memory(&mut self) -> &mut [u8] {
        (**self).memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_from_integer() {
        assert_eq!(Value::I32(3).as_count(), Some(3));
        assert_eq!(Value::I32(0).as_count(), Some(0));
        assert_eq!(Value::I32(-1).as_count(), None);
    }

    #[test]
    fn test_count_from_float() {
        assert_eq!(Value::F64(2.9).as_count(), Some(2));
        assert_eq!(Value::F64(-0.5).as_count(), None);
        assert_eq!(Value::F64(f64::NAN).as_count(), None);
        assert_eq!(Value::F64(f64::INFINITY).as_count(), None);
    }

    #[test]
    fn test_value_json_is_bare_number() {
        assert_eq!(serde_json::to_string(&Value::I32(7)).unwrap(), "7");
        let v: Value = serde_json::from_str("-2").unwrap();
        assert_eq!(v, Value::I32(-2));
        let v: Value = serde_json::from_str("0.25").unwrap();
        assert_eq!(v, Value::F64(0.25));
    }
}
