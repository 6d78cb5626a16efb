use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::backend::{ConnectionFactory, TcpConnector};
use crate::config::ReplicationConfig;
use crate::router::ReplicationRouter;
use crate::topology::{ManualTopology, NodeRegistry, SentinelTopology, TopologySource};

/// Build a router over TCP connections and load its initial topology.
pub async fn connect(config: &ReplicationConfig) -> Result<ReplicationRouter> {
    let factory = Arc::new(TcpConnector::new(config.tcp_settings()));
    connect_with(config, factory).await
}

/// Like `connect`, with connections created by `factory`.
pub async fn connect_with(
    config: &ReplicationConfig,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<ReplicationRouter> {
    config.ensure_valid()?;
    let source = topology_source(config);
    let mode = source.mode();
    let registry = NodeRegistry::new(
        source,
        factory,
        config.connection_defaults(),
        config.replica_selection,
    );
    let router = ReplicationRouter::new(Arc::new(registry), config.retry_policy())
        .with_session_policy(config.session_policy());
    router
        .initialize()
        .await
        .with_context(|| format!("failed to load {} topology", mode.as_str()))?;
    info!(
        mode = mode.as_str(),
        master = ?router.master().ok().map(|m| m.address()),
        slaves = router.slaves().len(),
        "replication router ready"
    );
    Ok(router)
}

/// Manual topology when `master`/`slaves` are configured, Sentinel otherwise.
pub fn topology_source(config: &ReplicationConfig) -> Arc<dyn TopologySource> {
    if config.is_manual() {
        Arc::new(ManualTopology::new(
            config.master.clone(),
            config.slaves.clone().unwrap_or_default(),
        ))
    } else {
        Arc::new(SentinelTopology::new(
            config.sentinels.clone(),
            config.sentinel_options(),
        ))
    }
}
