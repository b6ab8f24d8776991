// src/core/protocol/mod.rs

pub mod codec;
pub mod command;
pub mod command_type;
pub mod value;

pub use codec::{CodecKind, CommandCodec, HANDSHAKE_MAGIC};
pub use command::Command;
pub use command_type::{CommandType, Reserved};
pub use value::ArgValue;
