pub mod connection;
#[cfg(test)]
pub(crate) mod mock;

pub use connection::{
    ConnectionFactory, NodeConnection, TcpConnection, TcpConnector, TcpSettings,
    DEFAULT_CONNECT_TIMEOUT,
};
