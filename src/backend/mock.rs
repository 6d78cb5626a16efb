//! Scripted in-memory node connections for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::backend::connection::{ConnectionFactory, NodeConnection};
use crate::error::NodeError;
use crate::protocol::redis::{RedisCommand, RespValue};
use crate::topology::Endpoint;

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Reply(RespValue),
    Fail(&'static str),
    /// Never answer, like a node that stopped responding mid-request.
    Hang,
}

#[derive(Default)]
struct MockNodeState {
    script: VecDeque<MockOutcome>,
    fail_always: bool,
    log: Vec<String>,
    connections: usize,
    disconnects: usize,
}

/// Behaviour of one fake node, shared by every connection created for it.
///
/// Without a scripted outcome a node answers with its own address, so tests
/// can tell which node served a command.
#[derive(Clone)]
pub struct MockNode {
    address: Arc<str>,
    state: Arc<Mutex<MockNodeState>>,
}

impl MockNode {
    pub fn push(&self, outcome: MockOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    pub fn fail_always(&self, enabled: bool) {
        self.state.lock().fail_always = enabled;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    fn next_outcome(&self) -> MockOutcome {
        let mut state = self.state.lock();
        if state.fail_always {
            return MockOutcome::Fail("node unreachable");
        }
        state
            .script
            .pop_front()
            .unwrap_or_else(|| MockOutcome::Reply(RespValue::bulk(self.address.as_bytes())))
    }
}

#[derive(Default)]
pub struct MockFactory {
    nodes: Mutex<HashMap<String, MockNode>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node(&self, address: &str) -> MockNode {
        self.nodes
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| MockNode {
                address: address.into(),
                state: Arc::default(),
            })
            .clone()
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self, endpoint: &Endpoint) -> Box<dyn NodeConnection> {
        let node = self.node(&endpoint.address());
        node.state.lock().connections += 1;
        Box::new(MockConnection {
            node,
            pending: VecDeque::new(),
            open: true,
        })
    }
}

struct MockConnection {
    node: MockNode,
    pending: VecDeque<RespValue>,
    open: bool,
}

#[async_trait]
impl NodeConnection for MockConnection {
    async fn write_request(&mut self, command: &RedisCommand) -> Result<(), NodeError> {
        self.node.state.lock().log.push(command.to_string());
        match self.node.next_outcome() {
            MockOutcome::Reply(reply) => {
                self.pending.push_back(reply);
                Ok(())
            }
            MockOutcome::Fail(reason) => {
                self.open = false;
                Err(NodeError::Communication(anyhow!(reason)))
            }
            MockOutcome::Hang => std::future::pending().await,
        }
    }

    async fn read_response(&mut self, _command: &RedisCommand) -> Result<RespValue, NodeError> {
        self.pending
            .pop_front()
            .ok_or_else(|| NodeError::Communication(anyhow!("no request in flight")))
    }

    async fn disconnect(&mut self) {
        self.open = false;
        self.node.state.lock().disconnects += 1;
    }

    fn is_connected(&self) -> bool {
        self.open
    }
}
