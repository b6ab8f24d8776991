// src/core/protocol/value.rs

//! Argument values carried by a `Command`.

use std::fmt;

/// A single argument value.
///
/// The plain codec only transports the string rendering of a value; the typed
/// codec tags each value with its kind so numbers round-trip exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    /// An application-serialized object.
    Structured(String),
}

impl ArgValue {
    /// The string form used on the plain wire and by the typed accessors.
    pub fn to_wire_string(&self) -> String {
        match self {
            ArgValue::Null => String::new(),
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Long(l) => l.to_string(),
            ArgValue::Float(f) => f.to_string(),
            ArgValue::Double(d) => d.to_string(),
            ArgValue::Str(s) | ArgValue::Structured(s) => s.clone(),
        }
    }

    /// Borrows the text of string-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) | ArgValue::Structured(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }

    /// Interprets the value as a 64-bit integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i as i64),
            ArgValue::Long(l) => Some(*l),
            ArgValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interprets the value as a double.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Int(i) => Some(*i as f64),
            ArgValue::Long(l) => Some(*l as f64),
            ArgValue::Float(f) => Some(*f as f64),
            ArgValue::Double(d) => Some(*d),
            ArgValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interprets the value as a boolean. Strings accept `true`/`false` in any case.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            ArgValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire_string())
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Str(s)
    }
}

impl From<&String> for ArgValue {
    fn from(s: &String) -> Self {
        ArgValue::Str(s.clone())
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Bool(b)
    }
}

impl From<i32> for ArgValue {
    fn from(i: i32) -> Self {
        ArgValue::Int(i)
    }
}

impl From<i64> for ArgValue {
    fn from(l: i64) -> Self {
        ArgValue::Long(l)
    }
}

impl From<u64> for ArgValue {
    fn from(l: u64) -> Self {
        ArgValue::Long(l.min(i64::MAX as u64) as i64)
    }
}

impl From<usize> for ArgValue {
    fn from(n: usize) -> Self {
        ArgValue::Long(n.min(i64::MAX as usize) as i64)
    }
}

impl From<f32> for ArgValue {
    fn from(f: f32) -> Self {
        ArgValue::Float(f)
    }
}

impl From<f64> for ArgValue {
    fn from(d: f64) -> Self {
        ArgValue::Double(d)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ArgValue::Null)
    }
}
