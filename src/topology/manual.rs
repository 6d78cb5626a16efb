use anyhow::Result;
use async_trait::async_trait;

use super::{EndpointSpec, ResolvedTopology, TopologyMode, TopologySource};

/// Operator-supplied topology for deployments where Sentinel's announced
/// addresses are not reachable from the client.
///
/// The specs only seed an empty registry. Later changes are pushed through
/// `NodeRegistry::set_master` / `set_slaves`, and `NodeRegistry::refresh`
/// skips this source once any addresses are installed.
#[derive(Debug, Clone, Default)]
pub struct ManualTopology {
    initial: ResolvedTopology,
}

impl ManualTopology {
    pub fn new(master: Option<EndpointSpec>, slaves: Vec<EndpointSpec>) -> Self {
        Self {
            initial: ResolvedTopology { master, slaves },
        }
    }
}

#[async_trait]
impl TopologySource for ManualTopology {
    fn mode(&self) -> TopologyMode {
        TopologyMode::Manual
    }

    async fn resolve(&self) -> Result<ResolvedTopology> {
        Ok(self.initial.clone())
    }
}
