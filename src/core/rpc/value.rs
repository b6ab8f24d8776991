// src/core/rpc/value.rs

//! Values passed to and returned from remote methods, and the parameter
//! kinds methods declare.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote call argument or return value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum RpcValue {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Char(char),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    List(Vec<RpcValue>),
    /// An application object: a class name plus named fields.
    Object {
        class: String,
        fields: IndexMap<String, RpcValue>,
    },
}

impl RpcValue {
    pub fn object(class: impl Into<String>) -> Self {
        RpcValue::Object {
            class: class.into(),
            fields: IndexMap::new(),
        }
    }

    /// Adds a field to an `Object` value. Other values are returned unchanged.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<RpcValue>) -> Self {
        if let RpcValue::Object { fields, .. } = &mut self {
            fields.insert(key.into(), value.into());
        }
        self
    }

    /// The kind this value has on the wire. `Null` has none.
    pub fn kind(&self) -> Option<ParamKind> {
        let kind = match self {
            RpcValue::Null => return None,
            RpcValue::Bool(_) => ParamKind::Bool,
            RpcValue::Byte(_) => ParamKind::Byte,
            RpcValue::Short(_) => ParamKind::Short,
            RpcValue::Char(_) => ParamKind::Char,
            RpcValue::Int(_) => ParamKind::Int,
            RpcValue::Long(_) => ParamKind::Long,
            RpcValue::Float(_) => ParamKind::Float,
            RpcValue::Double(_) => ParamKind::Double,
            RpcValue::Str(_) => ParamKind::Str,
            RpcValue::List(_) => ParamKind::List,
            RpcValue::Object { class, .. } => ParamKind::Object(class.clone()),
        };
        Some(kind)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RpcValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::Byte(v) => Some(*v as i64),
            RpcValue::Short(v) => Some(*v as i64),
            RpcValue::Char(c) => Some(*c as i64),
            RpcValue::Int(v) => Some(*v as i64),
            RpcValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::Float(v) => Some(*v as f64),
            RpcValue::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a value accepted for `kind` into that kind's representation.
    ///
    /// Only called after matching succeeded, so conversions here are widenings.
    pub(crate) fn coerce(self, kind: &ParamKind) -> RpcValue {
        if self.kind().as_ref() == Some(kind) {
            return self;
        }
        let widened = match kind {
            ParamKind::Short => self.as_i64().map(|n| RpcValue::Short(n as i16)),
            ParamKind::Int => self.as_i64().map(|n| RpcValue::Int(n as i32)),
            ParamKind::Long => self.as_i64().map(RpcValue::Long),
            ParamKind::Float => self.as_f64().map(|n| RpcValue::Float(n as f32)),
            ParamKind::Double => self.as_f64().map(RpcValue::Double),
            _ => None,
        };
        widened.unwrap_or(self)
    }
}

impl fmt::Display for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcValue::Null => f.write_str("null"),
            RpcValue::Bool(v) => write!(f, "{v}"),
            RpcValue::Byte(v) => write!(f, "{v}"),
            RpcValue::Short(v) => write!(f, "{v}"),
            RpcValue::Char(v) => write!(f, "{v}"),
            RpcValue::Int(v) => write!(f, "{v}"),
            RpcValue::Long(v) => write!(f, "{v}"),
            RpcValue::Float(v) => write!(f, "{v}"),
            RpcValue::Double(v) => write!(f, "{v}"),
            RpcValue::Str(v) => f.write_str(v),
            RpcValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            RpcValue::Object { class, .. } => write!(f, "{class}{{..}}"),
        }
    }
}

impl From<bool> for RpcValue {
    fn from(v: bool) -> Self {
        RpcValue::Bool(v)
    }
}

impl From<i8> for RpcValue {
    fn from(v: i8) -> Self {
        RpcValue::Byte(v)
    }
}

impl From<i16> for RpcValue {
    fn from(v: i16) -> Self {
        RpcValue::Short(v)
    }
}

impl From<char> for RpcValue {
    fn from(v: char) -> Self {
        RpcValue::Char(v)
    }
}

impl From<i32> for RpcValue {
    fn from(v: i32) -> Self {
        RpcValue::Int(v)
    }
}

impl From<i64> for RpcValue {
    fn from(v: i64) -> Self {
        RpcValue::Long(v)
    }
}

impl From<f32> for RpcValue {
    fn from(v: f32) -> Self {
        RpcValue::Float(v)
    }
}

impl From<f64> for RpcValue {
    fn from(v: f64) -> Self {
        RpcValue::Double(v)
    }
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        RpcValue::Str(v.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(v: String) -> Self {
        RpcValue::Str(v)
    }
}

impl<T: Into<RpcValue>> From<Vec<T>> for RpcValue {
    fn from(v: Vec<T>) -> Self {
        RpcValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<()> for RpcValue {
    fn from(_: ()) -> Self {
        RpcValue::Null
    }
}

/// The declared kind of a remote method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Bool,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    Str,
    List,
    /// An object of the named class or any declared subtype of it.
    Object(String),
    /// Accepts any value, including null.
    Any,
}

impl ParamKind {
    /// Reference kinds accept `null`; primitives do not.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            ParamKind::Str | ParamKind::List | ParamKind::Object(_) | ParamKind::Any
        )
    }

    /// Primitive widening: whether a value of kind `from` may be passed where
    /// `self` is declared.
    pub fn widens_from(&self, from: &ParamKind) -> bool {
        use ParamKind::*;
        match self {
            Short => matches!(from, Byte),
            Int => matches!(from, Byte | Short | Char),
            Long => matches!(from, Byte | Short | Char | Int),
            Float => matches!(from, Byte | Short | Char | Int | Long),
            Double => matches!(from, Byte | Short | Char | Int | Long | Float),
            _ => false,
        }
    }

    /// The name used in method signatures, e.g. `sum(int,int)`.
    pub fn signature_name(&self) -> String {
        match self {
            ParamKind::Bool => "boolean".into(),
            ParamKind::Byte => "byte".into(),
            ParamKind::Short => "short".into(),
            ParamKind::Char => "char".into(),
            ParamKind::Int => "int".into(),
            ParamKind::Long => "long".into(),
            ParamKind::Float => "float".into(),
            ParamKind::Double => "double".into(),
            ParamKind::Str => "string".into(),
            ParamKind::List => "list".into(),
            ParamKind::Object(class) => class.clone(),
            ParamKind::Any => "any".into(),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature_name())
    }
}

/// The arguments a handler receives, already coerced to the declared kinds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcArgs(Vec<RpcValue>);

impl RpcArgs {
    pub fn new(values: Vec<RpcValue>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RpcValue> {
        self.0.get(index)
    }

    pub fn into_inner(self) -> Vec<RpcValue> {
        self.0
    }

    fn at(&self, index: usize) -> Result<&RpcValue, String> {
        self.0
            .get(index)
            .ok_or_else(|| format!("missing argument {index}"))
    }

    pub fn i32(&self, index: usize) -> Result<i32, String> {
        let value = self.at(index)?;
        value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| format!("argument {index} ({value}) is not an int"))
    }

    pub fn i64(&self, index: usize) -> Result<i64, String> {
        let value = self.at(index)?;
        value
            .as_i64()
            .ok_or_else(|| format!("argument {index} ({value}) is not a long"))
    }

    pub fn f64(&self, index: usize) -> Result<f64, String> {
        let value = self.at(index)?;
        value
            .as_f64()
            .ok_or_else(|| format!("argument {index} ({value}) is not a number"))
    }

    pub fn bool(&self, index: usize) -> Result<bool, String> {
        let value = self.at(index)?;
        value
            .as_bool()
            .ok_or_else(|| format!("argument {index} ({value}) is not a boolean"))
    }

    pub fn str(&self, index: usize) -> Result<&str, String> {
        let value = self.at(index)?;
        value
            .as_str()
            .ok_or_else(|| format!("argument {index} ({value}) is not a string"))
    }
}
