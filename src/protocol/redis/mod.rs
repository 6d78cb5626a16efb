mod codec;
mod command;
mod types;

pub use codec::RespCodec;
pub use command::{script_kind, CommandKind, RedisCommand, ScriptKind};
pub use types::RespValue;
