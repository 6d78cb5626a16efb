use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
#[cfg(any(unix, windows))]
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::protocol::redis::{RedisCommand, RespCodec, RespValue};
use crate::topology::{Endpoint, EndpointSpec};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1_000);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// A connection to a single node.
///
/// `write_request` and `read_response` are the two halves of a round-trip;
/// `execute_command` performs both. Transport problems are reported as
/// `NodeError::Communication`, error replies come back as `RespValue::Error`.
#[async_trait]
pub trait NodeConnection: Send {
    async fn write_request(&mut self, command: &RedisCommand) -> Result<(), NodeError>;

    async fn read_response(&mut self, command: &RedisCommand) -> Result<RespValue, NodeError>;

    async fn execute_command(&mut self, command: &RedisCommand) -> Result<RespValue, NodeError> {
        self.write_request(command).await?;
        self.read_response(command).await
    }

    /// Close the underlying socket. The object must not be reused afterwards.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Produces fresh, not yet connected, connection objects for an endpoint.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn NodeConnection>;
}

#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub connect_timeout: Duration,
    /// Bound on each send and each reply read; `None` waits indefinitely.
    pub io_timeout: Option<Duration>,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: None,
        }
    }
}

/// Factory for real TCP connections speaking RESP2.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    settings: TcpSettings,
}

impl TcpConnector {
    pub fn new(settings: TcpSettings) -> Self {
        Self { settings }
    }
}

impl ConnectionFactory for TcpConnector {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn NodeConnection> {
        Box::new(TcpConnection::new(endpoint.clone(), self.settings.clone()))
    }
}

/// Lazily connected TCP connection; the socket is opened (and AUTH/SELECT
/// applied) on the first request.
pub struct TcpConnection {
    endpoint: Endpoint,
    settings: TcpSettings,
    framed: Option<Framed<TcpStream, RespCodec>>,
}

impl TcpConnection {
    pub fn new(endpoint: Endpoint, settings: TcpSettings) -> Self {
        Self {
            endpoint,
            settings,
            framed: None,
        }
    }

    async fn ensure_connected(&mut self) -> Result<&mut Framed<TcpStream, RespCodec>> {
        if self.framed.is_none() {
            let framed = open_stream(self.endpoint.spec(), self.settings.connect_timeout).await?;
            debug!(
                alias = %self.endpoint.alias(),
                backend = %self.endpoint.address(),
                "node connection established"
            );
            self.framed = Some(framed);
        }
        self.framed
            .as_mut()
            .ok_or_else(|| anyhow!("connection unavailable"))
    }

    async fn send(&mut self, command: &RedisCommand) -> Result<()> {
        let io_timeout = self.settings.io_timeout;
        let framed = self.ensure_connected().await?;
        with_timeout(io_timeout, framed.send(command.to_resp()))
            .await
            .context("timed out sending command")??;
        Ok(())
    }

    async fn receive(&mut self) -> Result<RespValue> {
        let io_timeout = self.settings.io_timeout;
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| anyhow!("connection is not open"))?;
        match with_timeout(io_timeout, framed.next()).await {
            Ok(Some(Ok(value))) => Ok(value),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => Err(anyhow!("backend closed connection")),
            Err(_) => Err(anyhow!("timed out waiting for response")),
        }
    }
}

#[async_trait]
impl NodeConnection for TcpConnection {
    async fn write_request(&mut self, command: &RedisCommand) -> Result<(), NodeError> {
        match self.send(command).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.framed = None;
                Err(NodeError::Communication(err.context(format!(
                    "failed to write to {}",
                    self.endpoint.address()
                ))))
            }
        }
    }

    async fn read_response(&mut self, _command: &RedisCommand) -> Result<RespValue, NodeError> {
        match self.receive().await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.framed = None;
                Err(NodeError::Communication(err.context(format!(
                    "failed to read from {}",
                    self.endpoint.address()
                ))))
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            if let Err(err) = framed.close().await {
                debug!(
                    alias = %self.endpoint.alias(),
                    error = %err,
                    "error while closing node connection"
                );
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.framed.is_some()
    }
}

async fn with_timeout<F: std::future::Future>(
    limit: Option<Duration>,
    future: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    match limit {
        Some(limit) => timeout(limit, future).await,
        None => Ok(future.await),
    }
}

/// Open a framed RESP stream to `spec` and run the AUTH/SELECT handshake.
pub(crate) async fn open_stream(
    spec: &EndpointSpec,
    connect_timeout: Duration,
) -> Result<Framed<TcpStream, RespCodec>> {
    let address = spec.address();
    let stream = timeout(connect_timeout, TcpStream::connect(&address))
        .await
        .with_context(|| format!("connection to {} timed out", address))??;
    stream
        .set_nodelay(true)
        .with_context(|| format!("failed to set TCP_NODELAY for {}", address))?;
    #[cfg(any(unix, windows))]
    {
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_INTERVAL)
            .with_interval(KEEPALIVE_INTERVAL);
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!(backend = %address, error = %err, "failed to enable TCP keepalive");
        }
    }
    let mut framed = Framed::new(stream, RespCodec);

    if let Some(password) = &spec.password {
        let mut parts = vec![Bytes::from_static(b"AUTH")];
        if let Some(username) = &spec.username {
            parts.push(Bytes::copy_from_slice(username.as_bytes()));
        }
        parts.push(Bytes::copy_from_slice(password.as_bytes()));
        handshake(&mut framed, RedisCommand::new(parts)?, connect_timeout, &address, "AUTH")
            .await?;
    }
    if let Some(db) = spec.database.filter(|db| *db != 0) {
        let select = RedisCommand::from_args(["SELECT".to_string(), db.to_string()])?;
        handshake(&mut framed, select, connect_timeout, &address, "SELECT").await?;
    }
    Ok(framed)
}

/// Send one command and read its reply, bounded by `limit`.
pub(crate) async fn round_trip(
    framed: &mut Framed<TcpStream, RespCodec>,
    command: &RedisCommand,
    limit: Duration,
) -> Result<RespValue> {
    timeout(limit, framed.send(command.to_resp()))
        .await
        .context("timed out sending command")??;
    match timeout(limit, framed.next()).await {
        Ok(Some(Ok(value))) => Ok(value),
        Ok(Some(Err(err))) => Err(err),
        Ok(None) => Err(anyhow!("backend closed connection")),
        Err(_) => Err(anyhow!("timed out waiting for response")),
    }
}

async fn handshake(
    framed: &mut Framed<TcpStream, RespCodec>,
    command: RedisCommand,
    limit: Duration,
    target: &str,
    step: &str,
) -> Result<()> {
    let reply = round_trip(framed, &command, limit)
        .await
        .with_context(|| format!("{step} handshake with {target} failed"))?;
    if let RespValue::Error(message) = reply {
        bail!(
            "backend {} rejected {}: {}",
            target,
            step,
            String::from_utf8_lossy(&message)
        );
    }
    Ok(())
}
