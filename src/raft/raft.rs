/*
    Consensus facade of a replica.

    The leader owns the log. One apply thread appends every proposal to
    the durable log, applies it to the counter and answers the proposer.
    Followers forward proposals to the leader they joined and relay the
    committed result. There is no election: who leads is decided at
    bootstrap.
*/

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::SystemTime;

use reqwest::header::CONTENT_TYPE;
use tarpc::client::RpcError;
use tarpc::context;
use tokio::sync::{self, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::conn::ConnectionLayer;
use super::error::ConsensusError;
use super::rpc::ReplicaClient;
use super::sm::{CounterStateMachine, SNAPSHOT_LEN};
use super::state::{NodeState, Peer, Role};
use super::NodeStatus;
use crate::storage::command::{ApplyContext, Command, CommandOutcome, IncrementCommand, JoinCommand};
use crate::storage::store::{LogEntry, LogStore};
use crate::utils::helpers::RaftConfig;

use raft_helpers::gen_rand_timeout;

const REQUEST_QUEUE_DEPTH: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, ConsensusError>>;

enum Request {
    Propose {
        command: Command,
        reply: Reply<CommandOutcome>,
    },
    Follow {
        leader: Peer,
        reply: Reply<()>,
    },
    InstallSnapshot {
        index: u64,
        data: Vec<u8>,
        reply: Reply<bool>,
    },
}

#[derive(Clone)]
pub struct Raft {
    name: Arc<str>,
    config: RaftConfig,
    state: Arc<Mutex<NodeState>>,
    counter: Arc<Mutex<CounterStateMachine>>,
    requests: mpsc::Sender<Request>,
    leader_client: Arc<sync::Mutex<Option<ReplicaClient>>>,
}

impl Raft {
    /// Recovers the node from `config.persist_path` and starts the apply
    /// thread.
    ///
    /// A node configured with a leader starts as a follower that has not
    /// joined yet; otherwise it leads. A persisted role wins over both.
    pub fn init(name: impl Into<String>, config: RaftConfig) -> Result<Raft, ConsensusError> {
        let name: String = name.into();
        let store = LogStore::open(&config.persist_path)?;

        let initial_role = match config.leader {
            Some(_) => Role::Follower { leader: None },
            None => Role::Leader,
        };
        let mut state = store
            .read_state::<NodeState>()?
            .unwrap_or_else(|| NodeState::init_state(name.clone(), initial_role));
        if state.name != name {
            warn!(persisted = %state.name, configured = %name, "node name changed");
            state.name = name.clone();
        }

        let mut counter = match store.read_snapshot()? {
            Some(data) => CounterStateMachine::from_snapshot(&data)?,
            None => CounterStateMachine::new(),
        };

        // entries at or below the snapshot index are already in the snapshot
        let mut replayed = 0usize;
        for entry in store.entries() {
            if entry.index <= state.snapshot_index {
                continue;
            }
            entry.command.apply(&mut ApplyContext {
                counter: &mut counter,
                members: &mut state.members,
            });
            state.commit_index = entry.index;
            replayed += 1;
        }
        state.commit_index = state.commit_index.max(state.snapshot_index);

        info!(
            name = %name,
            role = state.role.as_str(),
            high_water_mark = counter.high_water_mark(),
            commit_index = state.commit_index,
            replayed,
            "recovered/initialized raft state"
        );

        let state = Arc::new(Mutex::new(state));
        let counter = Arc::new(Mutex::new(counter));
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);

        let driver = ApplyDriver {
            store,
            state: Arc::clone(&state),
            counter: Arc::clone(&counter),
            snapshot_threshold: config.snapshot_threshold,
            poisoned: None,
        };
        thread::Builder::new()
            .name(format!("apply-{}", name))
            .spawn(move || driver.run(rx))
            .map_err(|e: io::Error| ConsensusError::Storage(e.to_string()))?;

        Ok(Raft {
            name: name.into(),
            config,
            state,
            counter,
            requests,
            leader_client: Arc::new(sync::Mutex::new(None)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Identity other replicas reach this node by.
    pub fn peer(&self) -> Peer {
        Peer {
            name: self.name.to_string(),
            connection_string: self.config.listener_addr.to_string(),
        }
    }

    pub fn role(&self) -> Role {
        self.read_state().role.clone()
    }

    pub fn is_log_empty(&self) -> bool {
        self.read_state().is_log_empty()
    }

    pub fn high_water_mark(&self) -> i64 {
        self.read_counter().high_water_mark()
    }

    pub fn members(&self) -> Vec<Peer> {
        self.read_state()
            .members
            .iter()
            .map(|(name, addr)| Peer {
                name: name.clone(),
                connection_string: addr.clone(),
            })
            .collect()
    }

    /// Commit index together with the counter snapshot taken at it.
    pub fn snapshot(&self) -> (u64, [u8; SNAPSHOT_LEN]) {
        let state = self.read_state();
        let counter = self.read_counter();
        (state.commit_index, counter.save())
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.read_state();
        let counter = self.read_counter();
        NodeStatus {
            name: state.name.clone(),
            role: state.role.as_str().to_string(),
            leader: state.leader_name(),
            high_water_mark: counter.high_water_mark(),
            commit_index: state.commit_index,
            members: state.members.keys().cloned().collect(),
        }
    }

    /// Commits an increment and returns the high-water mark after it,
    /// forwarding to the leader when this node follows.
    pub async fn propose(&self, command: IncrementCommand) -> Result<i64, ConsensusError> {
        if command.num < 1 {
            return Err(ConsensusError::InvalidBatch(command.num));
        }
        match self.role() {
            Role::Leader => self.propose_local(command).await,
            Role::Follower {
                leader: Some(leader),
            } => self.forward(&leader, command).await,
            Role::Follower { leader: None } => Err(ConsensusError::NotLeader { leader: None }),
        }
    }

    /// Commits an increment on this node only.
    pub async fn propose_local(&self, command: IncrementCommand) -> Result<i64, ConsensusError> {
        let outcome = self
            .submit(|reply| Request::Propose {
                command: Command::Increment(command),
                reply,
            })
            .await?;
        match outcome {
            CommandOutcome::Timestamp(high_water_mark) => Ok(high_water_mark),
            other => Err(ConsensusError::Unavailable(format!(
                "unexpected outcome {:?}",
                other
            ))),
        }
    }

    /// Adds a replica to the membership. Leader only.
    pub async fn add_member(&self, command: JoinCommand) -> Result<Peer, ConsensusError> {
        let leader = {
            let state = self.read_state();
            (!state.role.is_leader()).then(|| state.leader_name())
        };
        if let Some(leader) = leader {
            return Err(ConsensusError::NotLeader { leader });
        }

        info!(member = %command.name, addr = %command.connection_string, "adding member");
        self.submit(|reply| Request::Propose {
            command: Command::Join(command),
            reply,
        })
        .await?;
        Ok(self.peer())
    }

    /// Registers this node as the first member of a new cluster.
    pub async fn bootstrap(&self) -> Result<(), ConsensusError> {
        let peer = self.peer();
        self.add_member(JoinCommand::new(peer.name, peer.connection_string))
            .await
            .map(|_| ())
    }

    /// Joins the cluster led by the node serving HTTP at `leader`, then
    /// follows it.
    pub async fn join(&self, leader: &str) -> Result<(), ConsensusError> {
        {
            let state = self.read_state();
            if state.role.is_leader() && !state.is_log_empty() {
                return Err(ConsensusError::Rejected(
                    "cannot join with an existing log".to_string(),
                ));
            }
        }

        let peer = self.peer();
        let command = JoinCommand::new(peer.name, peer.connection_string);
        let body = serde_json::to_vec(&command)
            .map_err(|e| ConsensusError::Rejected(format!("encode join descriptor: {}", e)))?;

        let response = reqwest::Client::new()
            .post(format!("http://{}/join", leader))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ConsensusError::Unavailable(format!("join {}: {}", leader, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConsensusError::Rejected(format!(
                "{} refused join with status {}",
                leader, status
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConsensusError::Unavailable(format!("join {}: {}", leader, e)))?;
        let leader_peer: Peer = serde_json::from_slice(&bytes).map_err(|e| {
            ConsensusError::Unavailable(format!("malformed join response from {}: {}", leader, e))
        })?;

        info!(leader = %leader_peer.name, addr = %leader_peer.connection_string, "joined cluster");
        self.leader_client.lock().await.take();
        self.submit(|reply| Request::Follow {
            leader: leader_peer,
            reply,
        })
        .await
    }

    /// Installs a snapshot taken at `index` if it is newer than local state.
    pub async fn install_snapshot(&self, index: u64, data: Vec<u8>) -> Result<bool, ConsensusError> {
        self.submit(|reply| Request::InstallSnapshot { index, data, reply })
            .await
    }

    /// Heartbeats in the background: the leader pings every member and
    /// pushes its snapshot when the commit index moved; a follower pings
    /// its leader.
    pub async fn node_daemon(self) {
        let mut pushed: HashMap<String, u64> = HashMap::new();

        loop {
            tokio::time::sleep(gen_rand_timeout(self.config.heartbeat)).await;

            let (role, members) = {
                let state = self.read_state();
                (state.role.clone(), state.members.clone())
            };

            match role {
                Role::Leader => {
                    let (index, data) = self.snapshot();
                    for (name, addr) in members.iter().filter(|(n, _)| n.as_str() != self.name()) {
                        let snapshot = match pushed.get(name) {
                            Some(&last) if last >= index => None,
                            _ => Some((index, data.to_vec())),
                        };
                        match self.heartbeat(addr, snapshot).await {
                            Ok(installed) => {
                                debug!(peer = %name, addr = %addr, index, installed, "heartbeat");
                                pushed.insert(name.clone(), index);
                            }
                            Err(err) => warn!(peer = %name, addr = %addr, error = %err, "member unreachable"),
                        }
                    }
                }
                Role::Follower {
                    leader: Some(leader),
                } => {
                    if ConnectionLayer::ping_node_wrapper(
                        &leader.connection_string,
                        self.name().to_string(),
                    )
                    .await
                    .is_none()
                    {
                        warn!(leader = %leader.name, addr = %leader.connection_string, "leader unreachable");
                    }
                }
                Role::Follower { leader: None } => {}
            }
        }
    }

    async fn heartbeat(
        &self,
        addr: &str,
        snapshot: Option<(u64, Vec<u8>)>,
    ) -> Result<bool, ConsensusError> {
        let client = ConnectionLayer::connect(addr)
            .await
            .map_err(|e| ConsensusError::Unavailable(e.to_string()))?;
        client
            .ping(context::current(), self.name().to_string())
            .await
            .map_err(|e| ConsensusError::Unavailable(e.to_string()))?;

        match snapshot {
            Some((index, data)) => client
                .install_snapshot(context::current(), index, data)
                .await
                .map_err(|e| ConsensusError::Unavailable(e.to_string()))?,
            None => Ok(false),
        }
    }

    async fn forward(&self, leader: &Peer, command: IncrementCommand) -> Result<i64, ConsensusError> {
        let client = self.leader_client(leader).await?;
        let mut ctx = context::current();
        ctx.deadline = SystemTime::now() + self.config.propose_timeout;

        match client.propose(ctx, command.num).await {
            Ok(result) => result,
            Err(RpcError::DeadlineExceeded) => Err(forward_error(leader, RpcError::DeadlineExceeded)),
            Err(err) => {
                self.leader_client.lock().await.take();
                Err(forward_error(leader, err))
            }
        }
    }

    async fn leader_client(&self, leader: &Peer) -> Result<ReplicaClient, ConsensusError> {
        let mut cached = self.leader_client.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }
        let client = ConnectionLayer::connect(&leader.connection_string)
            .await
            .map_err(|e| {
                ConsensusError::Unavailable(format!("connect to leader {}: {}", leader.name, e))
            })?;
        *cached = Some(client.clone());
        Ok(client)
    }

    async fn submit<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, ConsensusError> {
        let (reply, rx) = oneshot::channel();
        let request = request(reply);

        let waited = tokio::time::timeout(self.config.propose_timeout, async {
            self.requests.send(request).await.map_err(|_| stopped())?;
            rx.await.map_err(|_| stopped())?
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::Timeout),
        }
    }

    fn read_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_counter(&self) -> MutexGuard<'_, CounterStateMachine> {
        self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A forwarded proposal that ran out of time may still commit on the
/// leader, so it is a timeout rather than an unreachable leader.
fn forward_error(leader: &Peer, err: RpcError) -> ConsensusError {
    match err {
        RpcError::DeadlineExceeded => ConsensusError::Timeout,
        other => ConsensusError::Unavailable(format!(
            "forward to {} failed: {}",
            leader.name, other
        )),
    }
}

fn stopped() -> ConsensusError {
    ConsensusError::Unavailable("apply pipeline stopped".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, ConsensusError> {
    mutex
        .lock()
        .map_err(|e| ConsensusError::Unavailable(format!("lock poisoned: {}", e)))
}

/// The only writer of the log and the only caller of `Command::apply`.
struct ApplyDriver {
    store: LogStore,
    state: Arc<Mutex<NodeState>>,
    counter: Arc<Mutex<CounterStateMachine>>,
    snapshot_threshold: usize,
    // set after a storage failure, the log may hold a partial frame
    poisoned: Option<String>,
}

impl ApplyDriver {
    fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        while let Some(request) = requests.blocking_recv() {
            match request {
                Request::Propose { command, reply } => {
                    let result = self.guarded(|d| d.commit(command));
                    let _ = reply.send(result);
                }
                Request::Follow { leader, reply } => {
                    let result = self.guarded(|d| d.follow(leader));
                    let _ = reply.send(result);
                }
                Request::InstallSnapshot { index, data, reply } => {
                    let result = self.guarded(|d| d.install(index, data));
                    let _ = reply.send(result);
                }
            }
        }
        debug!("apply pipeline stopped");
    }

    fn guarded<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, ConsensusError>,
    ) -> Result<T, ConsensusError> {
        if let Some(reason) = &self.poisoned {
            return Err(ConsensusError::Unavailable(reason.clone()));
        }
        let result = op(self);
        if let Err(ConsensusError::Storage(reason)) = &result {
            error!(error = %reason, "storage failure, refusing further writes");
            self.poisoned = Some(reason.clone());
        }
        result
    }

    fn commit(&mut self, command: Command) -> Result<CommandOutcome, ConsensusError> {
        let index = {
            let state = lock(&self.state)?;
            if !state.role.is_leader() {
                return Err(ConsensusError::NotLeader {
                    leader: state.leader_name(),
                });
            }
            if let Command::Increment(cmd) = &command {
                if cmd.num < 1 {
                    return Err(ConsensusError::InvalidBatch(cmd.num));
                }
                if !lock(&self.counter)?.can_allocate(cmd.num) {
                    return Err(ConsensusError::Exhausted);
                }
            }
            state.commit_index + 1
        };

        // Readers never wait on the fsync. This thread is the only one that
        // moves the role, the counter and the commit index, so the checks
        // above still hold once the entry is durable.
        self.store.append(LogEntry::new(index, command.clone()))?;

        let (outcome, persisted) = {
            let state_lock = Arc::clone(&self.state);
            let counter_lock = Arc::clone(&self.counter);
            let mut state = lock(&state_lock)?;
            let mut counter = lock(&counter_lock)?;

            let outcome = command.apply(&mut ApplyContext {
                counter: &mut counter,
                members: &mut state.members,
            });
            state.commit_index = index;

            let snapshot_due = self.store.len() >= self.snapshot_threshold;
            let persisted = (snapshot_due || matches!(command, Command::Join(_)))
                .then(|| (state.clone(), snapshot_due.then(|| counter.clone())));
            (outcome, persisted)
        };

        match persisted {
            Some((state, Some(counter))) => self.take_snapshot(state, &counter)?,
            Some((state, None)) => self.store.write_state(&state)?,
            None => {}
        }
        Ok(outcome)
    }

    // A crash between these steps leaves a snapshot newer than the state
    // file says, so recovery replays some entries twice. That only skips
    // numbers, it never hands one out again.
    fn take_snapshot(
        &mut self,
        mut state: NodeState,
        counter: &CounterStateMachine,
    ) -> Result<(), ConsensusError> {
        self.store.write_snapshot(&counter.save())?;
        state.snapshot_index = state.commit_index;
        self.store.write_state(&state)?;
        self.store.compact()?;
        lock(&self.state)?.snapshot_index = state.snapshot_index;
        debug!(
            index = state.snapshot_index,
            high_water_mark = counter.high_water_mark(),
            "snapshot taken, log compacted"
        );
        Ok(())
    }

    fn follow(&mut self, leader: Peer) -> Result<(), ConsensusError> {
        let state_lock = Arc::clone(&self.state);
        let mut state = lock(&state_lock)?;
        if state.role.is_leader() && !state.is_log_empty() {
            return Err(ConsensusError::Rejected(
                "cannot join with an existing log".to_string(),
            ));
        }
        state.role = Role::Follower {
            leader: Some(leader),
        };
        self.store.write_state(&*state)?;
        Ok(())
    }

    fn install(&mut self, index: u64, data: Vec<u8>) -> Result<bool, ConsensusError> {
        let state_lock = Arc::clone(&self.state);
        let counter_lock = Arc::clone(&self.counter);
        let mut state = lock(&state_lock)?;
        if state.role.is_leader() {
            return Err(ConsensusError::Rejected(
                "leader does not install snapshots".to_string(),
            ));
        }
        if index <= state.commit_index {
            return Ok(false);
        }

        let next = CounterStateMachine::from_snapshot(&data)?;
        let mut counter = lock(&counter_lock)?;
        if next.high_water_mark() < counter.high_water_mark() {
            return Err(ConsensusError::Rejected(format!(
                "snapshot at {} would move the counter back from {} to {}",
                index,
                counter.high_water_mark(),
                next.high_water_mark()
            )));
        }

        self.store.write_snapshot(&data)?;
        *counter = next;
        state.commit_index = index;
        state.snapshot_index = index;
        self.store.write_state(&*state)?;
        self.store.compact()?;
        debug!(index, high_water_mark = counter.high_water_mark(), "snapshot installed");
        Ok(true)
    }
}

pub mod raft_helpers {
    use std::time::Duration;

    use rand::Rng;

    /// `base` plus up to a quarter of it, so replicas do not tick in step.
    pub fn gen_rand_timeout(base: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let spread = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rng.gen_range(0..spread))
    }
}
