use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::backend::connection::{open_stream, round_trip};
use crate::protocol::redis::{RedisCommand, RespValue};

use super::{EndpointSpec, ResolvedTopology, TopologyMode, TopologySource};

pub const DEFAULT_SENTINEL_TIMEOUT: Duration = Duration::from_millis(100);

const DOWN_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

#[derive(Debug, Clone)]
pub struct SentinelOptions {
    pub service: String,
    /// Bound on connecting to and querying one sentinel.
    pub timeout: Duration,
    /// Extend the sentinel list with peers reported by `SENTINEL sentinels`.
    pub update_sentinels: bool,
}

/// Topology discovered by asking Sentinel processes for the elected master
/// and its replicas.
pub struct SentinelTopology {
    options: SentinelOptions,
    sentinels: RwLock<Vec<EndpointSpec>>,
}

impl SentinelTopology {
    pub fn new(sentinels: Vec<EndpointSpec>, options: SentinelOptions) -> Self {
        Self {
            options,
            sentinels: RwLock::new(sentinels),
        }
    }

    /// Sentinels in the order they will be queried next.
    pub fn sentinels(&self) -> Vec<EndpointSpec> {
        self.sentinels.read().clone()
    }

    async fn query(
        &self,
        sentinel: &EndpointSpec,
    ) -> Result<(ResolvedTopology, Vec<EndpointSpec>)> {
        let limit = self.options.timeout;
        let service = self.options.service.as_str();
        let mut stream = open_stream(sentinel, limit).await?;

        let master = round_trip(
            &mut stream,
            &RedisCommand::from_args(["SENTINEL", "get-master-addr-by-name", service])?,
            limit,
        )
        .await?;
        let master = parse_master_addr(&master).with_context(|| {
            format!("sentinel {} has no usable master for {}", sentinel, service)
        })?;

        let slaves = round_trip(
            &mut stream,
            &RedisCommand::from_args(["SENTINEL", "slaves", service])?,
            limit,
        )
        .await?;
        let slaves = parse_node_list(&slaves, true)?;

        let peers = if self.options.update_sentinels {
            let reply = round_trip(
                &mut stream,
                &RedisCommand::from_args(["SENTINEL", "sentinels", service])?,
                limit,
            )
            .await?;
            parse_node_list(&reply, false)?
                .into_iter()
                .map(|mut peer| {
                    peer.username = sentinel.username.clone();
                    peer.password = sentinel.password.clone();
                    peer
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok((
            ResolvedTopology {
                master: Some(master),
                slaves,
            },
            peers,
        ))
    }

    /// Move the sentinel that answered to the front and append new peers.
    fn remember(&self, working: &EndpointSpec, peers: Vec<EndpointSpec>) {
        let mut guard = self.sentinels.write();
        guard.retain(|known| known != working);
        guard.insert(0, working.clone());
        for peer in peers {
            if !guard.iter().any(|known| known.address() == peer.address()) {
                info!(sentinel = %peer, "learned new sentinel");
                guard.push(peer);
            }
        }
    }
}

#[async_trait]
impl TopologySource for SentinelTopology {
    fn mode(&self) -> TopologyMode {
        TopologyMode::Discovered
    }

    async fn resolve(&self) -> Result<ResolvedTopology> {
        let candidates = self.sentinels();
        if candidates.is_empty() {
            bail!("no sentinels configured");
        }
        for sentinel in candidates {
            match self.query(&sentinel).await {
                Ok((resolved, peers)) => {
                    debug!(
                        sentinel = %sentinel,
                        service = %self.options.service,
                        slaves = resolved.slaves.len(),
                        "sentinel reported topology"
                    );
                    self.remember(&sentinel, peers);
                    return Ok(resolved);
                }
                Err(err) => {
                    warn!(
                        sentinel = %sentinel,
                        service = %self.options.service,
                        error = %err,
                        "failed to query sentinel"
                    );
                }
            }
        }
        Err(anyhow!(
            "all sentinels failed to resolve service {}",
            self.options.service
        ))
    }
}

fn parse_master_addr(reply: &RespValue) -> Result<EndpointSpec> {
    match reply {
        RespValue::Array(items) if items.len() == 2 => {
            let host = items[0]
                .to_text()
                .ok_or_else(|| anyhow!("master host is not a string"))?;
            let port = items[1]
                .to_text()
                .ok_or_else(|| anyhow!("master port is not a string"))?
                .parse::<u16>()
                .context("invalid master port")?;
            Ok(EndpointSpec::new(host, port))
        }
        RespValue::NullArray | RespValue::NullBulk => bail!("master is unknown to sentinel"),
        RespValue::Error(message) => bail!(
            "sentinel replied with error: {}",
            String::from_utf8_lossy(message)
        ),
        other => bail!("unexpected master address reply: {:?}", other),
    }
}

/// Parse `SENTINEL slaves|sentinels` replies: an array of flat field/value
/// arrays. With `skip_down`, nodes flagged down or disconnected are left out.
fn parse_node_list(reply: &RespValue, skip_down: bool) -> Result<Vec<EndpointSpec>> {
    let entries = match reply {
        RespValue::Array(entries) => entries,
        RespValue::NullArray => return Ok(Vec::new()),
        RespValue::Error(message) => bail!(
            "sentinel replied with error: {}",
            String::from_utf8_lossy(message)
        ),
        other => bail!("unexpected node list reply: {:?}", other),
    };

    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry
            .as_array()
            .ok_or_else(|| anyhow!("node entry must be an array"))?;
        let fields: HashMap<String, String> = fields
            .chunks(2)
            .filter_map(|pair| match pair {
                [key, value] => Some((key.to_text()?, value.to_text()?)),
                _ => None,
            })
            .collect();

        if skip_down {
            let flags = fields.get("flags").map(String::as_str).unwrap_or("");
            if flags.split(',').any(|flag| DOWN_FLAGS.contains(&flag)) {
                debug!(node = ?fields.get("name"), flags, "skipping unavailable node");
                continue;
            }
        }

        let host = fields
            .get("ip")
            .ok_or_else(|| anyhow!("node entry is missing ip"))?;
        let port = fields
            .get("port")
            .ok_or_else(|| anyhow!("node entry is missing port"))?
            .parse::<u16>()
            .context("invalid node port")?;
        nodes.push(EndpointSpec::new(host.clone(), port));
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: &str, port: &str, flags: &str) -> RespValue {
        RespValue::Array(
            [
                ("name", format!("{ip}:{port}")),
                ("ip", ip.to_string()),
                ("port", port.to_string()),
                ("flags", flags.to_string()),
            ]
            .into_iter()
            .flat_map(|(k, v)| [RespValue::bulk(k), RespValue::bulk(v)])
            .collect(),
        )
    }

    #[test]
    fn parses_master_address() {
        let reply = RespValue::Array(vec![RespValue::bulk("10.0.0.1"), RespValue::bulk("6379")]);
        assert_eq!(
            parse_master_addr(&reply).unwrap(),
            EndpointSpec::new("10.0.0.1", 6379)
        );
        assert!(parse_master_addr(&RespValue::NullArray).is_err());
        assert!(parse_master_addr(&RespValue::error("ERR unknown")).is_err());
    }

    #[test]
    fn skips_replicas_flagged_down() {
        let reply = RespValue::Array(vec![
            node("10.0.0.2", "6379", "slave"),
            node("10.0.0.3", "6379", "slave,s_down"),
            node("10.0.0.4", "6379", "slave,disconnected"),
            node("10.0.0.5", "6380", "slave"),
        ]);
        let slaves = parse_node_list(&reply, true).unwrap();
        assert_eq!(
            slaves,
            vec![
                EndpointSpec::new("10.0.0.2", 6379),
                EndpointSpec::new("10.0.0.5", 6380)
            ]
        );
        assert_eq!(parse_node_list(&reply, false).unwrap().len(), 4);
    }

    #[test]
    fn rejects_malformed_entries() {
        let reply = RespValue::Array(vec![RespValue::bulk("oops")]);
        assert!(parse_node_list(&reply, true).is_err());
        let missing_port = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::bulk("ip"),
            RespValue::bulk("10.0.0.2"),
        ])]);
        assert!(parse_node_list(&missing_port, true).is_err());
    }

    #[test]
    fn remember_promotes_working_sentinel_and_adds_peers() {
        let a = EndpointSpec::new("s1", 26379);
        let b = EndpointSpec::new("s2", 26379);
        let topology = SentinelTopology::new(
            vec![a.clone(), b.clone()],
            SentinelOptions {
                service: "mymaster".into(),
                timeout: DEFAULT_SENTINEL_TIMEOUT,
                update_sentinels: true,
            },
        );
        topology.remember(&b, vec![a.clone(), EndpointSpec::new("s3", 26379)]);
        let order: Vec<String> = topology.sentinels().iter().map(|s| s.address()).collect();
        assert_eq!(order, vec!["s2:26379", "s1:26379", "s3:26379"]);
    }

    #[tokio::test]
    async fn resolve_fails_without_sentinels() {
        let topology = SentinelTopology::new(
            Vec::new(),
            SentinelOptions {
                service: "mymaster".into(),
                timeout: DEFAULT_SENTINEL_TIMEOUT,
                update_sentinels: false,
            },
        );
        assert!(topology.resolve().await.is_err());
    }
}
