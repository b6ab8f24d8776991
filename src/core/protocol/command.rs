// src/core/protocol/command.rs

//! Defines `Command`, the unit exchanged between peers: a type plus a
//! string-keyed argument bag.

use super::codec::{MAX_ARGUMENTS, check_long_len, check_short_len};
use super::command_type::{CommandType, Reserved};
use super::value::ArgValue;
use crate::core::SessionError;
use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// One protocol message.
///
/// The type is fixed at construction. Arguments may be mutated freely until the
/// command is handed to an outbound queue, which takes it by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    command_type: CommandType,
    arguments: IndexMap<String, ArgValue>,
}

impl Command {
    pub fn new(command_type: impl Into<CommandType>) -> Self {
        Self {
            command_type: command_type.into(),
            arguments: IndexMap::new(),
        }
    }

    pub(crate) fn from_parts(
        command_type: CommandType,
        arguments: IndexMap<String, ArgValue>,
    ) -> Self {
        Self {
            command_type,
            arguments,
        }
    }

    /// Builder-style variant of [`Command::put`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.put(key, value);
        self
    }

    pub fn command_type(&self) -> &CommandType {
        &self.command_type
    }

    /// The wire name of this command's type.
    pub fn name(&self) -> &str {
        self.command_type.name()
    }

    /// The control command this is, if its type is reserved.
    pub fn reserved(&self) -> Option<Reserved> {
        self.command_type.reserved()
    }

    pub fn is(&self, reserved: Reserved) -> bool {
        self.reserved() == Some(reserved)
    }

    /// Sets an argument, returning the previous value if there was one.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Option<ArgValue> {
        self.arguments.insert(key.into(), value.into())
    }

    /// Serializes `value` as JSON and stores it as a structured argument.
    pub fn put_object<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), SessionError> {
        let encoded = serde_json::to_string(value)?;
        self.arguments
            .insert(key.to_string(), ArgValue::Structured(encoded));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<ArgValue> {
        self.arguments.shift_remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.arguments.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.arguments.contains_key(key)
    }

    /// The string form of an argument. Null values read as absent.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.arguments.get(key) {
            None | Some(ArgValue::Null) => None,
            Some(v) => Some(v.to_wire_string()),
        }
    }

    /// Like [`Command::get_str`], but a missing argument is an error.
    pub fn require_str(&self, key: &str) -> Result<String, SessionError> {
        self.get_str(key)
            .ok_or_else(|| SessionError::MissingArgument(key.to_string()))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, SessionError> {
        let value = self.require(key)?;
        value
            .as_i64()
            .ok_or_else(|| SessionError::invalid_argument(key, format!("'{value}' is not an integer")))
    }

    pub fn get_i32(&self, key: &str) -> Result<i32, SessionError> {
        let wide = self.get_i64(key)?;
        i32::try_from(wide)
            .map_err(|_| SessionError::invalid_argument(key, format!("{wide} is out of range")))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, SessionError> {
        let value = self.require(key)?;
        value
            .as_f64()
            .ok_or_else(|| SessionError::invalid_argument(key, format!("'{value}' is not a number")))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, SessionError> {
        let value = self.require(key)?;
        value
            .as_bool()
            .ok_or_else(|| SessionError::invalid_argument(key, format!("'{value}' is not a boolean")))
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Deserializes a structured argument written by [`Command::put_object`].
    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<T, SessionError> {
        let value = self.require(key)?;
        match value {
            ArgValue::Str(s) | ArgValue::Structured(s) => Ok(serde_json::from_str(s)?),
            other => Err(SessionError::invalid_argument(
                key,
                format!("'{other}' is not a serialized object"),
            )),
        }
    }

    pub fn arguments(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.arguments.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Checks the command against the frame limits of the codec, so an
    /// oversized command is refused before it is queued.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.arguments.len() > MAX_ARGUMENTS {
            return Err(SessionError::FrameTooLarge(format!(
                "{} arguments",
                self.arguments.len()
            )));
        }
        for (key, value) in &self.arguments {
            check_short_len(key.len())?;
            if let ArgValue::Str(s) | ArgValue::Structured(s) = value {
                check_long_len(s.len())?;
            }
        }
        Ok(())
    }

    fn require(&self, key: &str) -> Result<&ArgValue, SessionError> {
        match self.arguments.get(key) {
            None | Some(ArgValue::Null) => Err(SessionError::MissingArgument(key.to_string())),
            Some(v) => Ok(v),
        }
    }
}

impl From<Reserved> for Command {
    fn from(r: Reserved) -> Self {
        Command::new(r)
    }
}
