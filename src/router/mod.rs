pub mod classify;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::NodeConnection;
use crate::error::{NodeError, RouterError, RouterResult};
use crate::metrics;
use crate::protocol::redis::{CommandKind, RedisCommand, RespValue};
use crate::topology::{Endpoint, EndpointSpec, NodeRegistry, SharedConnection};

pub use classify::{script_digest, Classifier, ScriptTable};
pub use retry::{RetryExecutor, RetryPolicy, DEFAULT_RETRY_LIMIT, DEFAULT_RETRY_WAIT};

/// When a session forgets its node binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// Only at explicit boundaries: the end of `execute`, or dropping a
    /// `Session` / calling `Session::reset`.
    #[default]
    Explicit,
    /// Additionally once this long has passed since the session's last dispatch.
    IdleReset(Duration),
}

/// Node binding of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unselected,
    BoundToMaster,
    BoundToReplica(Arc<str>),
}

/// Routes commands to the master or a replica of one replication set.
///
/// Reads go to a replica when one is known, writes to the master. Within a
/// session, the first command that needs the master pins the session there.
pub struct ReplicationRouter {
    registry: Arc<NodeRegistry>,
    classifier: Classifier,
    executor: RetryExecutor,
    session_policy: SessionPolicy,
}

impl ReplicationRouter {
    pub fn new(registry: Arc<NodeRegistry>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            classifier: Classifier::new(),
            executor: RetryExecutor::new(retry, CancellationToken::new()),
            session_policy: SessionPolicy::default(),
        }
    }

    pub fn with_session_policy(mut self, policy: SessionPolicy) -> Self {
        self.session_policy = policy;
        self
    }

    /// Abort in-flight attempts and retry waits once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.executor = RetryExecutor::new(self.executor.policy(), token);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.executor.policy()
    }

    pub fn session_policy(&self) -> SessionPolicy {
        self.session_policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.executor.cancellation()
    }

    /// Load the initial topology from the configured source. With a manual
    /// source this is a no-op once addresses are installed.
    pub async fn initialize(&self) -> RouterResult<()> {
        self.registry.refresh().await
    }

    pub fn classify(&self, command: &RedisCommand) -> CommandKind {
        self.classifier.classify(command)
    }

    /// Mark a script body read-only (or back to write) before it is run.
    pub fn set_script_read_only(&self, body: &str, read_only: bool) {
        self.classifier.set_script_read_only(body, read_only);
    }

    pub async fn set_master(&self, spec: EndpointSpec) {
        self.registry.set_master(spec).await;
    }

    pub async fn set_slaves<I>(&self, specs: I)
    where
        I: IntoIterator<Item = EndpointSpec>,
    {
        self.registry.set_slaves(specs).await;
    }

    pub fn master(&self) -> RouterResult<Endpoint> {
        self.registry.master()
    }

    pub fn slaves(&self) -> Vec<Endpoint> {
        self.registry.slaves()
    }

    /// Start a multi-command session sharing one node binding.
    pub fn session(&self) -> Session<'_> {
        Session {
            router: self,
            state: SessionState::Unselected,
            last_dispatch: None,
        }
    }

    /// Run one command as its own session.
    pub async fn execute(&self, command: &RedisCommand) -> RouterResult<RespValue> {
        self.session().execute(command).await
    }

    /// Run a script as its own session, see `Session::eval_script`.
    pub async fn eval_script<K, A>(
        &self,
        body: &str,
        keys: &[K],
        args: &[A],
    ) -> RouterResult<RespValue>
    where
        K: AsRef<[u8]>,
        A: AsRef<[u8]>,
    {
        self.session().eval_script(body, keys, args).await
    }

    fn target(&self, state: &SessionState) -> RouterResult<Endpoint> {
        match state {
            SessionState::BoundToReplica(alias) => {
                match self
                    .registry
                    .endpoint(alias)
                    .or_else(|| self.registry.replica())
                {
                    Some(endpoint) => Ok(endpoint),
                    None => self.registry.master(),
                }
            }
            _ => self.registry.master(),
        }
    }

    async fn attempt(
        &self,
        state: &SessionState,
        kind: CommandKind,
        commands: &[RedisCommand],
        in_flight: &Mutex<Option<(Endpoint, SharedConnection)>>,
    ) -> RouterResult<(Vec<RespValue>, Arc<str>)> {
        let endpoint = self.target(state)?;
        let connection = self.registry.connection(&endpoint).await;

        let role = if endpoint.is_master() { "master" } else { "replica" };
        metrics::dispatch(role, kind.as_str());
        debug!(
            alias = %endpoint.alias(),
            kind = kind.as_str(),
            commands = commands.len(),
            "dispatching"
        );

        let result = {
            let _timer = metrics::dispatch_tracker(role);
            let mut guard = connection.lock().await;
            *in_flight.lock() = Some((endpoint.clone(), connection.clone()));
            let result = round_trip(&mut **guard, commands).await;
            in_flight.lock().take();
            result
        };

        match result {
            Ok(replies) => Ok((replies, endpoint.alias().clone())),
            Err(NodeError::Communication(source)) => {
                metrics::communication_failure(endpoint.alias());
                warn!(
                    alias = %endpoint.alias(),
                    backend = %endpoint.address(),
                    error = %source,
                    "communication failure"
                );
                self.registry.recover(&endpoint, &connection).await;
                Err(RouterError::Communication {
                    alias: endpoint.alias().clone(),
                    source,
                })
            }
        }
    }

    async fn dispatch(
        &self,
        state: &SessionState,
        kind: CommandKind,
        commands: &[RedisCommand],
    ) -> RouterResult<(Vec<RespValue>, Arc<str>)> {
        let in_flight = Mutex::new(None);
        let in_flight_ref = &in_flight;
        let result = self
            .executor
            .run(move || self.attempt(state, kind, commands, in_flight_ref))
            .await;

        // An attempt aborted by cancellation may leave an unread reply behind.
        let abandoned = in_flight.lock().take();
        if let Some((endpoint, connection)) = abandoned {
            self.registry.drop_connection(&endpoint, &connection).await;
        }
        result
    }
}

async fn round_trip(
    connection: &mut dyn NodeConnection,
    commands: &[RedisCommand],
) -> Result<Vec<RespValue>, NodeError> {
    if let [command] = commands {
        return Ok(vec![connection.execute_command(command).await?]);
    }
    for command in commands {
        connection.write_request(command).await?;
    }
    let mut replies = Vec::with_capacity(commands.len());
    for command in commands {
        replies.push(connection.read_response(command).await?);
    }
    Ok(replies)
}

/// A sequence of commands that share one master/replica decision.
///
/// A session starts `Unselected`. A read binds it to a replica (or to the
/// master when no replica is known); a write binds it to the master, and a
/// session bound to the master stays there until it is reset.
pub struct Session<'a> {
    router: &'a ReplicationRouter,
    state: SessionState,
    last_dispatch: Option<Instant>,
}

impl Session<'_> {
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Forget the node binding.
    pub fn reset(&mut self) {
        self.state = SessionState::Unselected;
    }

    /// Run one command. An error reply becomes `RouterError::Application`.
    pub async fn execute(&mut self, command: &RedisCommand) -> RouterResult<RespValue> {
        let kind = self.router.classify(command);
        let (reply, alias) = self.dispatch_one(kind, command).await?;
        application_result(alias, reply)
    }

    /// Send several commands back to back and collect their replies in order.
    ///
    /// The batch is routed as a whole: a single write sends all of it to the
    /// master. Error replies stay in the returned list. After a communication
    /// failure the whole batch is sent again.
    pub async fn pipeline(&mut self, commands: &[RedisCommand]) -> RouterResult<Vec<RespValue>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let kind = if commands
            .iter()
            .all(|command| self.router.classify(command).is_read())
        {
            CommandKind::Read
        } else {
            CommandKind::Write
        };
        self.bind(kind);
        let (replies, _) = self.router.dispatch(&self.state, kind, commands).await?;
        Ok(replies)
    }

    /// Evaluate a Lua script by digest, loading it with `EVAL` when the
    /// node reports `NOSCRIPT`. Both steps run on the same node.
    pub async fn eval_script<K, A>(
        &mut self,
        body: &str,
        keys: &[K],
        args: &[A],
    ) -> RouterResult<RespValue>
    where
        K: AsRef<[u8]>,
        A: AsRef<[u8]>,
    {
        let digest = script_digest(body);
        let evalsha = script_command("EVALSHA", digest.as_bytes(), keys, args)?;
        let kind = self.router.classify(&evalsha);
        let (reply, alias) = self.dispatch_one(kind, &evalsha).await?;
        if !is_noscript(&reply) {
            return application_result(alias, reply);
        }

        debug!(alias = %alias, digest = %digest, "script not cached, sending body");
        let eval = script_command("EVAL", body.as_bytes(), keys, args)?;
        let (reply, alias) = self.dispatch_one(kind, &eval).await?;
        application_result(alias, reply)
    }

    async fn dispatch_one(
        &mut self,
        kind: CommandKind,
        command: &RedisCommand,
    ) -> RouterResult<(RespValue, Arc<str>)> {
        self.bind(kind);
        let (replies, alias) = self
            .router
            .dispatch(&self.state, kind, std::slice::from_ref(command))
            .await?;
        let reply = replies.into_iter().next().ok_or_else(|| RouterError::Communication {
            alias: alias.clone(),
            source: anyhow::anyhow!("no reply received"),
        })?;
        Ok((reply, alias))
    }

    fn bind(&mut self, kind: CommandKind) {
        if let (SessionPolicy::IdleReset(idle), Some(last)) =
            (self.router.session_policy, self.last_dispatch)
        {
            if last.elapsed() > idle {
                debug!(idle_ms = idle.as_millis() as u64, "session idle, resetting");
                self.state = SessionState::Unselected;
            }
        }
        self.last_dispatch = Some(Instant::now());

        let next = match (&self.state, kind) {
            (SessionState::BoundToMaster, _) => return,
            (SessionState::BoundToReplica(_), CommandKind::Read) => return,
            (_, CommandKind::Write) => SessionState::BoundToMaster,
            (SessionState::Unselected, CommandKind::Read) => match self.router.registry.replica() {
                Some(replica) => SessionState::BoundToReplica(replica.alias().clone()),
                None => SessionState::BoundToMaster,
            },
        };
        debug!(from = ?self.state, to = ?next, "session binding changed");
        self.state = next;
    }
}

fn script_command<K, A>(
    name: &str,
    script: &[u8],
    keys: &[K],
    args: &[A],
) -> RouterResult<RedisCommand>
where
    K: AsRef<[u8]>,
    A: AsRef<[u8]>,
{
    let numkeys = keys.len().to_string();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(3 + keys.len() + args.len());
    parts.push(name.as_bytes());
    parts.push(script);
    parts.push(numkeys.as_bytes());
    parts.extend(keys.iter().map(|key| key.as_ref()));
    parts.extend(args.iter().map(|arg| arg.as_ref()));
    RedisCommand::from_args(parts).map_err(|err| RouterError::InvalidCommand(err.to_string()))
}

fn is_noscript(reply: &RespValue) -> bool {
    matches!(reply, RespValue::Error(message) if message.starts_with(b"NOSCRIPT"))
}

fn application_result(alias: Arc<str>, reply: RespValue) -> RouterResult<RespValue> {
    match reply {
        RespValue::Error(message) => Err(RouterError::Application {
            alias,
            message: String::from_utf8_lossy(&message).into_owned(),
        }),
        reply => Ok(reply),
    }
}
