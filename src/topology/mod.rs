mod endpoint;
pub mod manual;
mod registry;
pub mod sentinel;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use endpoint::{ConnectionDefaults, Endpoint, EndpointSpec, DEFAULT_REDIS_PORT, MASTER_ALIAS};
pub use manual::ManualTopology;
pub use registry::{NodeRegistry, SharedConnection};
pub use sentinel::{SentinelOptions, SentinelTopology};

/// Immutable view of the replication set. Replaced as a whole on reload, so a
/// reader always sees a master and a replica list from the same generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    master: Option<Endpoint>,
    slaves: Vec<Endpoint>,
}

impl Topology {
    pub fn new(master: Option<Endpoint>, slaves: Vec<Endpoint>) -> Self {
        Self { master, slaves }
    }

    /// Build from raw specs, assigning `master` / `slave-N` aliases by position.
    pub fn from_specs(master: Option<EndpointSpec>, slaves: Vec<EndpointSpec>) -> Self {
        Self {
            master: master.map(Endpoint::master),
            slaves: aliased_slaves(slaves),
        }
    }

    pub fn master(&self) -> Option<&Endpoint> {
        self.master.as_ref()
    }

    pub fn slaves(&self) -> &[Endpoint] {
        &self.slaves
    }

    pub fn find(&self, alias: &str) -> Option<&Endpoint> {
        self.master
            .iter()
            .chain(self.slaves.iter())
            .find(|endpoint| &**endpoint.alias() == alias)
    }

    pub fn with_master(&self, master: Option<Endpoint>) -> Self {
        Self {
            master,
            slaves: self.slaves.clone(),
        }
    }

    pub fn with_slaves(&self, slaves: Vec<Endpoint>) -> Self {
        Self {
            master: self.master.clone(),
            slaves,
        }
    }
}

pub(crate) fn aliased_slaves(specs: Vec<EndpointSpec>) -> Vec<Endpoint> {
    specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| Endpoint::slave(index, spec))
        .collect()
}

/// Master/replica addresses as reported by a topology source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTopology {
    pub master: Option<EndpointSpec>,
    pub slaves: Vec<EndpointSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyMode {
    /// Addresses supplied by configuration or pushed by an operator.
    Manual,
    /// Addresses discovered by querying Sentinel processes.
    Discovered,
}

impl TopologyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TopologyMode::Manual => "manual",
            TopologyMode::Discovered => "discovered",
        }
    }
}

/// Where the registry learns master/replica addresses from.
#[async_trait]
pub trait TopologySource: Send + Sync + 'static {
    fn mode(&self) -> TopologyMode;

    async fn resolve(&self) -> Result<ResolvedTopology>;
}

/// How `NodeRegistry::replica` picks among the known replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSelection {
    #[default]
    RoundRobin,
    First,
    Random,
}
