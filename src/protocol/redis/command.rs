use std::fmt;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;

use super::types::RespValue;

#[derive(Clone)]
pub struct RedisCommand {
    parts: Vec<Bytes>,
}

impl fmt::Debug for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCommand")
            .field(
                "parts",
                &self
                    .parts
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RedisCommand {
    pub fn new(parts: Vec<Bytes>) -> Result<Self> {
        if parts.is_empty() {
            bail!("redis command must contain at least one element");
        }
        Ok(Self { parts })
    }

    /// Build a command from anything byte-like, e.g. `["SET", "k", "v"]`.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self::new(
            args.into_iter()
                .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
                .collect(),
        )
    }

    pub fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Array(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                            parts.push(data)
                        }
                        RespValue::Integer(int) => {
                            parts.push(Bytes::copy_from_slice(int.to_string().as_bytes()))
                        }
                        RespValue::NullBulk | RespValue::NullArray => {
                            bail!("command argument cannot be null");
                        }
                        RespValue::Error(err) => {
                            bail!(
                                "RESP error frame cannot be a command argument: {}",
                                String::from_utf8_lossy(&err)
                            );
                        }
                        RespValue::Array(_) => {
                            bail!("nested array arguments are not supported");
                        }
                    }
                }
                Self::new(parts)
            }
            other => Err(anyhow!(
                "redis command must be an array frame, received {:?}",
                other
            )),
        }
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(
            self.parts
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }

    pub fn command_name(&self) -> &[u8] {
        self.parts.first().map(|b| b.as_ref()).unwrap_or(&[])
    }

    pub fn args(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.parts.get(index).map(|b| b.as_ref())
    }

    /// Name-based read/write classification; scripts are always `Write` here,
    /// see `router::Classifier` for the override-aware variant.
    pub fn kind(&self) -> CommandKind {
        command_kind(self.command_name(), &self.parts)
    }
}

impl fmt::Display for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .collect();
        write!(f, "{}", args.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Read,
    Write,
}

impl CommandKind {
    pub fn is_read(self) -> bool {
        self == CommandKind::Read
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Read => "read",
            CommandKind::Write => "write",
        }
    }
}

/// How a scripting command names its script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// `EVAL <body> ...`
    Body,
    /// `EVALSHA <sha1> ...`
    Digest,
    /// `EVAL_RO`, `EVALSHA_RO`, `FCALL_RO`: declared read-only by the caller.
    ReadOnly,
}

pub fn script_kind(name: &[u8]) -> Option<ScriptKind> {
    let name = uppercase_name(name);
    match name.as_slice() {
        b"EVAL" => Some(ScriptKind::Body),
        b"EVALSHA" => Some(ScriptKind::Digest),
        b"EVAL_RO" | b"EVALSHA_RO" | b"FCALL_RO" => Some(ScriptKind::ReadOnly),
        _ => None,
    }
}

fn command_kind(cmd: &[u8], parts: &[Bytes]) -> CommandKind {
    if cmd.is_empty() || cmd.len() > 32 {
        return CommandKind::Write;
    }
    let mut upper = [0u8; 32];
    for (i, byte) in cmd.iter().enumerate() {
        upper[i] = byte.to_ascii_uppercase();
    }
    let name = &upper[..cmd.len()];
    match name {
        b"EXISTS" | b"TYPE" | b"KEYS" | b"SCAN" | b"RANDOMKEY" | b"TTL" | b"PTTL" | b"GET"
        | b"MGET" | b"SUBSTR" | b"STRLEN" | b"GETRANGE" | b"GETBIT" | b"LLEN" | b"LRANGE"
        | b"LINDEX" | b"SCARD" | b"SISMEMBER" | b"SMISMEMBER" | b"SINTER" | b"SUNION"
        | b"SDIFF" | b"SMEMBERS" | b"SSCAN" | b"SRANDMEMBER" | b"ZRANGE" | b"ZREVRANGE"
        | b"ZRANGEBYSCORE" | b"ZREVRANGEBYSCORE" | b"ZCARD" | b"ZSCORE" | b"ZMSCORE"
        | b"ZCOUNT" | b"ZRANK" | b"ZREVRANK" | b"ZSCAN" | b"ZLEXCOUNT" | b"ZRANGEBYLEX"
        | b"ZREVRANGEBYLEX" | b"HGET" | b"HMGET" | b"HEXISTS" | b"HLEN" | b"HKEYS" | b"HVALS"
        | b"HGETALL" | b"HSCAN" | b"HSTRLEN" | b"PING" | b"AUTH" | b"SELECT" | b"ECHO"
        | b"QUIT" | b"OBJECT" | b"BITCOUNT" | b"BITPOS" | b"TIME" | b"PFCOUNT" | b"GEOHASH"
        | b"GEOPOS" | b"GEODIST" | b"EVAL_RO" | b"EVALSHA_RO" | b"FCALL_RO" => CommandKind::Read,
        b"SORT" => read_unless_any(parts, &[b"STORE"]),
        b"BITFIELD" => read_unless_any(parts, &[b"SET", b"INCRBY"]),
        b"GEORADIUS" | b"GEORADIUSBYMEMBER" => read_unless_any(parts, &[b"STORE", b"STOREDIST"]),
        _ => CommandKind::Write,
    }
}

fn read_unless_any(parts: &[Bytes], markers: &[&[u8]]) -> CommandKind {
    let writes = parts
        .iter()
        .skip(2)
        .any(|arg| markers.iter().any(|marker| arg.eq_ignore_ascii_case(marker)));
    if writes {
        CommandKind::Write
    } else {
        CommandKind::Read
    }
}

fn uppercase_name(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b.to_ascii_uppercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> RedisCommand {
        RedisCommand::from_args(args.iter()).unwrap()
    }

    #[test]
    fn read_commands_classify_as_read() {
        for name in ["GET", "get", "Exists", "MGET", "HGETALL", "ZRANGE", "TTL", "PING"] {
            assert_eq!(cmd(&[name, "k"]).kind(), CommandKind::Read, "{name}");
        }
    }

    #[test]
    fn write_commands_classify_as_write() {
        for name in ["SET", "DEL", "EXPIRE", "SETEX", "INCR", "HSET", "GETSET", "FLUSHDB"] {
            assert_eq!(cmd(&[name, "k"]).kind(), CommandKind::Write, "{name}");
        }
    }

    #[test]
    fn unknown_and_script_commands_default_to_write() {
        assert_eq!(cmd(&["SOMETHINGNEW"]).kind(), CommandKind::Write);
        assert_eq!(cmd(&["EVAL", "return 1", "0"]).kind(), CommandKind::Write);
        assert_eq!(cmd(&["EVAL_RO", "return 1", "0"]).kind(), CommandKind::Read);
    }

    #[test]
    fn argument_sensitive_commands_look_at_options() {
        assert_eq!(cmd(&["SORT", "list"]).kind(), CommandKind::Read);
        assert_eq!(cmd(&["SORT", "list", "STORE", "dst"]).kind(), CommandKind::Write);
        assert_eq!(
            cmd(&["BITFIELD", "k", "GET", "u4", "0"]).kind(),
            CommandKind::Read
        );
        assert_eq!(
            cmd(&["BITFIELD", "k", "incrby", "u4", "0", "1"]).kind(),
            CommandKind::Write
        );
        assert_eq!(
            cmd(&["GEORADIUS", "g", "15", "37", "200", "km", "STOREDIST", "d"]).kind(),
            CommandKind::Write
        );
        // the key itself is never treated as an option
        assert_eq!(cmd(&["SORT", "store"]).kind(), CommandKind::Read);
    }

    #[test]
    fn from_resp_rejects_nested_arrays() {
        let value = RespValue::Array(vec![
            RespValue::bulk("GET"),
            RespValue::Array(vec![RespValue::bulk("k")]),
        ]);
        assert!(RedisCommand::from_resp(value).is_err());
    }

    #[test]
    fn script_kind_detects_variants() {
        assert_eq!(script_kind(b"eval"), Some(ScriptKind::Body));
        assert_eq!(script_kind(b"EVALSHA"), Some(ScriptKind::Digest));
        assert_eq!(script_kind(b"fcall_ro"), Some(ScriptKind::ReadOnly));
        assert_eq!(script_kind(b"GET"), None);
    }
}
