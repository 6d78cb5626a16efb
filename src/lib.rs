//! Replication-aware Redis routing.
//!
//! Reads are sent to replicas and writes to the master of a replication set
//! whose addresses come either from Redis Sentinel or from an operator
//! supplied list that can be replaced at runtime.

pub mod backend;
pub mod cache;
pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod topology;

pub use cache::SentinelStore;
pub use config::ReplicationConfig;
pub use connector::{connect, connect_with};
pub use error::{NodeError, RouterError, RouterResult};
pub use router::{ReplicationRouter, RetryPolicy, Session, SessionPolicy, SessionState};
pub use topology::{Endpoint, EndpointSpec, NodeRegistry};
