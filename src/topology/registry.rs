use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::backend::{ConnectionFactory, NodeConnection};
use crate::error::{RouterError, RouterResult};
use crate::metrics;

use super::{
    aliased_slaves, ConnectionDefaults, Endpoint, EndpointSpec, ReplicaSelection,
    ResolvedTopology, Topology, TopologyMode, TopologySource,
};

/// Connection handle lent out for the duration of one dispatch.
pub type SharedConnection = Arc<tokio::sync::Mutex<Box<dyn NodeConnection>>>;

struct CachedConnection {
    endpoint: Endpoint,
    connection: SharedConnection,
}

/// Current master/replica endpoints plus the connections that serve them.
///
/// The registry exclusively owns every node connection. Callers borrow a
/// `SharedConnection` for one dispatch and hand failures back through
/// `drop_connection` / `recover`.
pub struct NodeRegistry {
    topology: ArcSwap<Topology>,
    source: Arc<dyn TopologySource>,
    factory: Arc<dyn ConnectionFactory>,
    defaults: ConnectionDefaults,
    selection: ReplicaSelection,
    cursor: AtomicUsize,
    /// Set once any topology has been installed; a manual source only seeds.
    seeded: AtomicBool,
    connections: Mutex<HashMap<Arc<str>, CachedConnection>>,
}

impl NodeRegistry {
    pub fn new(
        source: Arc<dyn TopologySource>,
        factory: Arc<dyn ConnectionFactory>,
        defaults: ConnectionDefaults,
        selection: ReplicaSelection,
    ) -> Self {
        Self {
            topology: ArcSwap::from_pointee(Topology::default()),
            source,
            factory,
            defaults,
            selection,
            cursor: AtomicUsize::new(0),
            seeded: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> TopologyMode {
        self.source.mode()
    }

    /// Consistent snapshot of master and replicas.
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    pub fn master(&self) -> RouterResult<Endpoint> {
        self.topology
            .load()
            .master()
            .cloned()
            .ok_or(RouterError::NoMasterConfigured)
    }

    pub fn slaves(&self) -> Vec<Endpoint> {
        self.topology.load().slaves().to_vec()
    }

    /// Pick a replica according to the configured policy, `None` when the
    /// replica list is empty.
    pub fn replica(&self) -> Option<Endpoint> {
        let topology = self.topology.load();
        let slaves = topology.slaves();
        if slaves.is_empty() {
            return None;
        }
        let index = match self.selection {
            ReplicaSelection::First => 0,
            ReplicaSelection::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % slaves.len()
            }
            ReplicaSelection::Random => rand::thread_rng().gen_range(0..slaves.len()),
        };
        slaves.get(index).cloned()
    }

    /// Look an endpoint up by alias in the current snapshot.
    pub fn endpoint(&self, alias: &str) -> Option<Endpoint> {
        self.topology.load().find(alias).cloned()
    }

    /// Replace the master. Any connection held for the previous master is
    /// disconnected and never reused.
    pub async fn set_master(&self, spec: EndpointSpec) {
        let master = Endpoint::master(spec.merged_with(&self.defaults));
        info!(master = %master, "master endpoint replaced");
        self.topology
            .rcu(|current| Topology::with_master(current, Some(master.clone())));
        self.seeded.store(true, Ordering::Release);
        metrics::topology_reload("set_master");
        self.invalidate_stale().await;
    }

    /// Replace the whole replica list; aliases are `slave-0`, `slave-1`, ...
    /// in the given order. Accepts a single spec too (`Some(spec)`).
    pub async fn set_slaves<I>(&self, specs: I)
    where
        I: IntoIterator<Item = EndpointSpec>,
    {
        let slaves = aliased_slaves(
            specs
                .into_iter()
                .map(|spec| spec.merged_with(&self.defaults))
                .collect(),
        );
        info!(count = slaves.len(), "replica endpoints replaced");
        self.topology
            .rcu(|current| Topology::with_slaves(current, slaves.clone()));
        self.seeded.store(true, Ordering::Release);
        metrics::topology_reload("set_slaves");
        self.invalidate_stale().await;
    }

    /// Replace master and replicas in one step.
    pub async fn apply(&self, resolved: ResolvedTopology) {
        let next = Topology::from_specs(
            resolved.master.map(|spec| spec.merged_with(&self.defaults)),
            resolved
                .slaves
                .into_iter()
                .map(|spec| spec.merged_with(&self.defaults))
                .collect(),
        );
        let next = Arc::new(next);
        let previous = self.topology.rcu(|_| next.clone());
        self.seeded.store(true, Ordering::Release);
        if previous == next {
            debug!("topology unchanged");
            return;
        }
        info!(
            master = ?next.master().map(|m| m.address()),
            slaves = next.slaves().len(),
            "topology applied"
        );
        metrics::topology_reload("apply");
        self.invalidate_stale().await;
    }

    /// Ask the topology source for the current addresses and apply them.
    ///
    /// A manual source only seeds an empty registry; once addresses are
    /// installed, pushed changes win over the configured ones.
    pub async fn refresh(&self) -> RouterResult<()> {
        if self.mode() == TopologyMode::Manual && self.seeded.load(Ordering::Acquire) {
            debug!("manual topology already installed, refresh skipped");
            return Ok(());
        }
        let resolved = self
            .source
            .resolve()
            .await
            .map_err(RouterError::Discovery)?;
        self.apply(resolved).await;
        Ok(())
    }

    /// Connection for `endpoint`, created through the factory on first use
    /// or after the previous one was dropped.
    pub async fn connection(&self, endpoint: &Endpoint) -> SharedConnection {
        let (connection, replaced) = {
            let mut guard = self.connections.lock();
            match guard.get(endpoint.alias()) {
                Some(cached) if cached.endpoint == *endpoint => {
                    return cached.connection.clone();
                }
                _ => {}
            }
            let connection: SharedConnection =
                Arc::new(tokio::sync::Mutex::new(self.factory.create(endpoint)));
            let replaced = guard.insert(
                endpoint.alias().clone(),
                CachedConnection {
                    endpoint: endpoint.clone(),
                    connection: connection.clone(),
                },
            );
            (connection, replaced)
        };
        if let Some(stale) = replaced {
            disconnect(&stale).await;
        }
        connection
    }

    /// Discard the connection that failed for `endpoint` so the next
    /// selection creates a fresh one. A newer connection already installed
    /// for the same alias is left alone.
    pub async fn drop_connection(&self, endpoint: &Endpoint, failed: &SharedConnection) {
        let removed = {
            let mut guard = self.connections.lock();
            match guard.get(endpoint.alias()) {
                Some(cached) if Arc::ptr_eq(&cached.connection, failed) => {
                    guard.remove(endpoint.alias())
                }
                _ => None,
            }
        };
        failed.lock().await.disconnect().await;
        if removed.is_some() {
            debug!(alias = %endpoint.alias(), "node connection dropped");
        }
    }

    /// Recovery step after a communication failure: drop the connection and,
    /// when addresses come from Sentinel, re-resolve them.
    pub async fn recover(&self, endpoint: &Endpoint, failed: &SharedConnection) {
        self.drop_connection(endpoint, failed).await;
        if self.mode() == TopologyMode::Discovered {
            if let Err(err) = self.refresh().await {
                warn!(
                    alias = %endpoint.alias(),
                    error = %err,
                    "failed to re-resolve topology after communication failure"
                );
            }
        }
    }

    /// Disconnect every connection whose endpoint left the current topology.
    async fn invalidate_stale(&self) {
        let topology = self.topology.load_full();
        let stale: Vec<CachedConnection> = {
            let mut guard = self.connections.lock();
            let aliases: Vec<Arc<str>> = guard
                .iter()
                .filter(|(alias, cached)| topology.find(alias) != Some(&cached.endpoint))
                .map(|(alias, _)| alias.clone())
                .collect();
            aliases
                .into_iter()
                .filter_map(|alias| guard.remove(&alias))
                .collect()
        };
        for cached in stale {
            debug!(endpoint = %cached.endpoint, "disconnecting replaced endpoint");
            disconnect(&cached).await;
        }
    }
}

async fn disconnect(cached: &CachedConnection) {
    cached.connection.lock().await.disconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockFactory;
    use crate::protocol::redis::RedisCommand;
    use crate::topology::ManualTopology;

    fn spec(addr: &str) -> EndpointSpec {
        addr.parse().unwrap()
    }

    fn registry(factory: Arc<MockFactory>, selection: ReplicaSelection) -> NodeRegistry {
        NodeRegistry::new(
            Arc::new(ManualTopology::default()),
            factory,
            ConnectionDefaults::default(),
            selection,
        )
    }

    #[tokio::test]
    async fn master_is_required() {
        let registry = registry(MockFactory::new(), ReplicaSelection::First);
        assert!(matches!(
            registry.master(),
            Err(RouterError::NoMasterConfigured)
        ));
        assert!(registry.replica().is_none());
    }

    #[tokio::test]
    async fn set_slaves_assigns_positional_aliases() {
        let registry = registry(MockFactory::new(), ReplicaSelection::First);
        registry
            .set_slaves(vec![spec("10.0.0.2:6379"), spec("10.0.0.3:6379")])
            .await;
        let slaves = registry.slaves();
        let aliases: Vec<&str> = slaves.iter().map(|s| &**s.alias()).collect();
        assert_eq!(aliases, vec!["slave-0", "slave-1"]);
        assert_eq!(slaves[0].address(), "10.0.0.2:6379");
        assert_eq!(slaves[1].address(), "10.0.0.3:6379");

        registry.set_slaves(Vec::new()).await;
        assert!(registry.slaves().is_empty());

        registry.set_slaves(Some(spec("10.0.0.9:6379"))).await;
        assert_eq!(&**registry.slaves()[0].alias(), "slave-0");
    }

    #[tokio::test]
    async fn round_robin_cycles_through_replicas() {
        let registry = registry(MockFactory::new(), ReplicaSelection::RoundRobin);
        registry
            .set_slaves(vec![spec("a:1"), spec("b:1"), spec("c:1")])
            .await;
        let picked: Vec<String> = (0..4)
            .map(|_| registry.replica().unwrap().address())
            .collect();
        assert_eq!(picked, vec!["a:1", "b:1", "c:1", "a:1"]);
    }

    #[tokio::test]
    async fn defaults_are_merged_into_pushed_specs() {
        let registry = NodeRegistry::new(
            Arc::new(ManualTopology::default()),
            MockFactory::new(),
            ConnectionDefaults {
                username: None,
                password: Some("pw".into()),
                database: Some(2),
            },
            ReplicaSelection::First,
        );
        registry.set_master(spec("10.0.0.1:6379")).await;
        let master = registry.master().unwrap();
        assert_eq!(master.spec().password.as_deref(), Some("pw"));
        assert_eq!(master.spec().database, Some(2));
    }

    #[tokio::test]
    async fn set_master_disconnects_previous_master_connection() {
        let factory = MockFactory::new();
        let registry = registry(factory.clone(), ReplicaSelection::First);
        registry.set_master(spec("10.0.0.1:6379")).await;
        let old = registry.master().unwrap();
        let first = registry.connection(&old).await;
        let again = registry.connection(&old).await;
        assert!(Arc::ptr_eq(&first, &again));

        registry.set_master(spec("10.0.0.5:6379")).await;
        assert_eq!(factory.node("10.0.0.1:6379").disconnects(), 1);

        let new_master = registry.master().unwrap();
        assert_eq!(new_master.address(), "10.0.0.5:6379");
        let fresh = registry.connection(&new_master).await;
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(factory.node("10.0.0.5:6379").connections(), 1);
    }

    #[tokio::test]
    async fn drop_connection_forces_a_new_connection() {
        let factory = MockFactory::new();
        let registry = registry(factory.clone(), ReplicaSelection::First);
        registry.set_master(spec("10.0.0.1:6379")).await;
        let master = registry.master().unwrap();
        let first = registry.connection(&master).await;
        registry.drop_connection(&master, &first).await;
        let second = registry.connection(&master).await;
        assert!(!Arc::ptr_eq(&first, &second));
        let node = factory.node("10.0.0.1:6379");
        assert_eq!(node.connections(), 2);
        assert_eq!(node.disconnects(), 1);

        // dropping the stale handle again must not evict the fresh one
        registry.drop_connection(&master, &first).await;
        let third = registry.connection(&master).await;
        assert!(Arc::ptr_eq(&second, &third));

        let command = RedisCommand::from_args(["PING"]).unwrap();
        let reply = third.lock().await.execute_command(&command).await.unwrap();
        assert_eq!(reply.as_bytes(), Some(&b"10.0.0.1:6379"[..]));
    }

    #[tokio::test]
    async fn pushed_addresses_survive_manual_refresh() {
        let source = ManualTopology::new(
            Some(spec("10.0.0.1:6379")),
            vec![spec("10.0.0.2:6379")],
        );
        let registry = NodeRegistry::new(
            Arc::new(source),
            MockFactory::new(),
            ConnectionDefaults::default(),
            ReplicaSelection::First,
        );
        registry.refresh().await.unwrap();
        assert_eq!(registry.master().unwrap().address(), "10.0.0.1:6379");

        registry.set_master(spec("10.0.0.9:6379")).await;
        registry.set_slaves(Vec::new()).await;
        registry.refresh().await.unwrap();
        assert_eq!(registry.master().unwrap().address(), "10.0.0.9:6379");
        assert!(registry.slaves().is_empty());
    }

    #[tokio::test]
    async fn pushed_master_before_initial_load_is_kept() {
        let source = ManualTopology::new(Some(spec("10.0.0.1:6379")), Vec::new());
        let registry = NodeRegistry::new(
            Arc::new(source),
            MockFactory::new(),
            ConnectionDefaults::default(),
            ReplicaSelection::First,
        );
        registry.set_master(spec("10.0.0.9:6379")).await;
        registry.refresh().await.unwrap();
        assert_eq!(registry.master().unwrap().address(), "10.0.0.9:6379");
    }

    #[tokio::test]
    async fn readers_never_observe_mixed_generations() {
        let registry = Arc::new(registry(MockFactory::new(), ReplicaSelection::First));
        registry
            .apply(ResolvedTopology {
                master: Some(spec("gen0:1")),
                slaves: vec![spec("gen0:2")],
            })
            .await;

        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..2_000 {
                    let snapshot = registry.topology();
                    let master = snapshot.master().unwrap().spec().host.clone();
                    let slave = snapshot.slaves()[0].spec().host.clone();
                    assert_eq!(master, slave);
                    tokio::task::yield_now().await;
                }
            })
        };

        for generation in 1..200 {
            let host = format!("gen{generation}");
            registry
                .apply(ResolvedTopology {
                    master: Some(EndpointSpec::new(host.clone(), 1)),
                    slaves: vec![EndpointSpec::new(host, 2)],
                })
                .await;
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();
    }
}
