use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{RouterError, RouterResult};
use crate::protocol::redis::{RedisCommand, RespValue};
use crate::router::ReplicationRouter;

/// Sets the key with a TTL only when it does not exist yet.
pub const ADD_SCRIPT: &str =
    "return redis.call('exists',KEYS[1])<1 and redis.call('setex',KEYS[1],ARGV[2],ARGV[1])";

/// Key/value cache helpers routed through a `ReplicationRouter`.
///
/// Keys are namespaced by `prefix`. TTLs are rounded down to whole seconds
/// with a floor of one second.
pub struct SentinelStore {
    router: Arc<ReplicationRouter>,
    prefix: String,
}

impl SentinelStore {
    pub fn new(router: Arc<ReplicationRouter>, prefix: impl Into<String>) -> Self {
        Self {
            router,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn router(&self) -> &Arc<ReplicationRouter> {
        &self.router
    }

    pub async fn get(&self, key: &str) -> RouterResult<Option<Bytes>> {
        let command = self.command(&["GET".as_bytes(), self.key(key).as_bytes()])?;
        match self.router.execute(&command).await? {
            RespValue::BulkString(value) | RespValue::SimpleString(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: impl AsRef<[u8]>, ttl: Duration) -> RouterResult<()> {
        let seconds = ttl_seconds(ttl).to_string();
        let command = self.command(&[
            "SETEX".as_bytes(),
            self.key(key).as_bytes(),
            seconds.as_bytes(),
            value.as_ref(),
        ])?;
        self.router.execute(&command).await?;
        Ok(())
    }

    /// Store `value` unless `key` already exists. Returns whether it was stored.
    pub async fn add(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> RouterResult<bool> {
        self.router.set_script_read_only(ADD_SCRIPT, false);
        let seconds = ttl_seconds(ttl).to_string();
        let reply = self
            .router
            .eval_script(
                ADD_SCRIPT,
                &[self.key(key).as_bytes()],
                &[value.as_ref(), seconds.as_bytes()],
            )
            .await?;
        Ok(match reply {
            RespValue::SimpleString(_) | RespValue::BulkString(_) => true,
            RespValue::Integer(value) => value != 0,
            _ => false,
        })
    }

    pub async fn forget(&self, key: &str) -> RouterResult<bool> {
        let command = self.command(&["DEL".as_bytes(), self.key(key).as_bytes()])?;
        Ok(matches!(self.router.execute(&command).await?, RespValue::Integer(n) if n > 0))
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn command(&self, parts: &[&[u8]]) -> RouterResult<RedisCommand> {
        RedisCommand::from_args(parts.iter().copied())
            .map_err(|err| RouterError::InvalidCommand(err.to_string()))
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
