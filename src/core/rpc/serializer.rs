// src/core/rpc/serializer.rs

use super::value::RpcValue;
use crate::core::SessionError;

/// Turns remote call arguments and results into argument strings and back.
///
/// Both peers must use compatible serializers.
pub trait ObjectSerializer: Send + Sync + 'static {
    fn serialize(&self, value: &RpcValue) -> Result<String, SessionError>;
    fn deserialize(&self, encoded: &str) -> Result<RpcValue, SessionError>;
}

/// The default serializer: `RpcValue`'s serde representation as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl ObjectSerializer for JsonSerializer {
    fn serialize(&self, value: &RpcValue) -> Result<String, SessionError> {
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, encoded: &str) -> Result<RpcValue, SessionError> {
        Ok(serde_json::from_str(encoded)?)
    }
}
