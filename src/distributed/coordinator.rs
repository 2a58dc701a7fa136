//! Distributed coordinator
//!
//! The coordinator owns the data set until it is handed out and every
//! statistic request after that. It:
//! - Stages submitted values and fans them out in chunks over the work channel
//! - Broadcasts protocol commands to every worker
//! - Collects replies on the results channel and advances request rounds
//! - Fails requests whose step deadline expires (when a round timeout is set)
//!
//! All state lives in a single actor task. The `Coordinator` handle only sends
//! it operations, so requests may be issued from any task.
//!
//! ```text
//!  submit() ──┐                       ┌─► work ──────► one worker per chunk
//!  average() ─┼─► ops ─► actor ───────┼─► broadcast ─► every worker
//!  median() ──┘            ▲          │
//!                          └── inbound ◄── results ◄── every worker
//! ```

use crate::config::Config;
use crate::distributed::node_service::new_worker_name;
use crate::distributed::protocol::*;
use crate::distributed::rounds::{RequestKind, Round, RoundError, Step};
use crate::distributed::transport::*;
use crate::distributed::worker::Worker;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Result delivered to a request's caller
pub type RoundResult = Result<f64, RoundError>;

/// Connected peers as seen by the coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Workers with all three channels connected
    pub ready: usize,
    pub broadcast_peers: usize,
    pub work_peers: usize,
    pub result_peers: usize,
}

/// Operation sent from the handle to the actor
enum Op {
    Submit { value: f64, is_final: bool },
    Request { kind: RequestKind, reply_to: oneshot::Sender<RoundResult> },
    Broadcast(Command),
    Shutdown,
}

/// Handle to a running coordinator
pub struct Coordinator {
    ops: mpsc::UnboundedSender<Op>,
    status: watch::Receiver<PoolStatus>,
    inbound: mpsc::UnboundedSender<Inbound>,
    ids: PeerIds,
    actor: JoinHandle<()>,
    hub: Option<TcpHub>,
}

impl Coordinator {
    /// Bind the three TCP channels and start the coordinator
    ///
    /// Fails if any channel cannot be bound.
    pub async fn start(config: Config) -> Result<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let ids = PeerIds::default();

        let hub = TcpHub::bind(&config.channels, inbound_tx.clone(), ids.clone())
            .await
            .context("Failed to start coordinator channels")?;

        let addrs = hub.local_addrs();
        info!(
            broadcast = %addrs.broadcast,
            work = %addrs.work,
            results = %addrs.results,
            workers = config.pool.workers,
            "Coordinator listening"
        );

        Ok(Self::spawn(config, inbound_tx, inbound_rx, ids, Some(hub)))
    }

    /// Start a coordinator without network channels
    ///
    /// Workers are attached with `spawn_local_worker`.
    pub fn start_local(config: Config) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        info!(workers = config.pool.workers, "Coordinator started (in-process)");
        Self::spawn(config, inbound_tx, inbound_rx, PeerIds::default(), None)
    }

    fn spawn(
        config: Config,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
        inbound_rx: mpsc::UnboundedReceiver<Inbound>,
        ids: PeerIds,
        hub: Option<TcpHub>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PoolStatus::default());

        let actor = Actor::new(config, ops_rx, inbound_rx, status_tx);
        let actor = tokio::spawn(actor.run());

        Self {
            ops: ops_tx,
            status: status_rx,
            inbound: inbound_tx,
            ids,
            actor,
            hub,
        }
    }

    /// Addresses the TCP channels are bound to (`None` for in-process coordinators)
    pub fn local_addrs(&self) -> Option<ChannelAddrs> {
        self.hub.as_ref().map(TcpHub::local_addrs)
    }

    /// Current view of connected peers
    pub fn status(&self) -> PoolStatus {
        *self.status.borrow()
    }

    /// Run a worker inside this process, wired straight to the coordinator
    pub fn spawn_local_worker(&self) -> Result<JoinHandle<Result<()>>> {
        let name = new_worker_name();
        let links = attach_local(&self.inbound, &self.ids, &name)?;
        Ok(tokio::spawn(Worker::new(name).run(links)))
    }

    /// Wait until at least `count` workers have all three channels connected
    pub async fn wait_for_workers(&self, count: usize) -> Result<()> {
        let mut status = self.status.clone();
        loop {
            if status.borrow_and_update().ready >= count {
                return Ok(());
            }
            status.changed().await.context("Coordinator stopped")?;
        }
    }

    /// Stage one value for distribution
    ///
    /// `is_final` flushes the staging buffer regardless of its size.
    pub fn submit(&self, value: f64, is_final: bool) -> Result<()> {
        if !value.is_finite() {
            anyhow::bail!("Cannot submit non-finite value {}", value);
        }
        self.send(Op::Submit { value, is_final })
    }

    /// Request the mean; `callback` is invoked exactly once with the outcome
    pub fn get_average<F>(&self, callback: F)
    where
        F: FnOnce(RoundResult) + Send + 'static,
    {
        self.request_with_callback(RequestKind::Average, callback);
    }

    /// Request the exact median; `callback` is invoked exactly once with the outcome
    pub fn get_median<F>(&self, callback: F)
    where
        F: FnOnce(RoundResult) + Send + 'static,
    {
        self.request_with_callback(RequestKind::Median, callback);
    }

    pub async fn average(&self) -> RoundResult {
        self.request(RequestKind::Average).await
    }

    pub async fn median(&self) -> RoundResult {
        self.request(RequestKind::Median).await
    }

    /// Ask every worker to log its partition
    pub fn dump_worker_caches(&self) -> Result<()> {
        self.send(Op::Broadcast(Command::DumpLocalCache))
    }

    /// Ask every worker to drop its partition
    pub fn reset_workers(&self) -> Result<()> {
        self.send(Op::Broadcast(Command::ResetLocalCache))
    }

    /// Stop the coordinator, failing outstanding requests and closing every channel
    pub async fn stop(self) -> Result<()> {
        // Already gone if the actor exited on its own
        let _ = self.ops.send(Op::Shutdown);
        self.actor.await.context("Coordinator task failed")?;

        if let Some(hub) = self.hub {
            hub.shutdown();
        }
        info!("Coordinator stopped");
        Ok(())
    }

    async fn request(&self, kind: RequestKind) -> RoundResult {
        let (reply_to, result) = oneshot::channel();
        if self.ops.send(Op::Request { kind, reply_to }).is_err() {
            return Err(RoundError::Stopped);
        }
        result.await.unwrap_or(Err(RoundError::Stopped))
    }

    fn request_with_callback<F>(&self, kind: RequestKind, callback: F)
    where
        F: FnOnce(RoundResult) + Send + 'static,
    {
        let (reply_to, result) = oneshot::channel();
        // A dropped op drops `reply_to`, which resolves the callback with `Stopped`
        let _ = self.ops.send(Op::Request { kind, reply_to });

        tokio::spawn(async move {
            callback(result.await.unwrap_or(Err(RoundError::Stopped)));
        });
    }

    fn send(&self, op: Op) -> Result<()> {
        self.ops
            .send(op)
            .map_err(|_| anyhow::anyhow!("Coordinator is not running"))
    }
}

/// Split a staged batch into `workers` contiguous chunks
///
/// Every chunk holds `len / workers` values; the remainder goes to the last
/// one. Chunks may be empty when there are fewer values than workers.
pub fn split_batch(mut values: Vec<f64>, workers: usize) -> Vec<WorkChunk> {
    let workers = workers.max(1);
    let size = values.len() / workers;

    let mut chunks = Vec::with_capacity(workers);
    for _ in 1..workers {
        let rest = values.split_off(size);
        chunks.push(values);
        values = rest;
    }
    chunks.push(values);
    chunks
}

/// Request in flight
struct PendingRequest {
    round: Round,
    reply_to: oneshot::Sender<RoundResult>,
    deadline: Option<Instant>,
}

struct Actor {
    config: Config,
    ops: mpsc::UnboundedReceiver<Op>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    status: watch::Sender<PoolStatus>,

    peers: HashMap<PeerId, (String, ChannelKind)>,
    broadcast: BTreeMap<PeerId, mpsc::UnboundedSender<Command>>,
    work: BTreeMap<PeerId, mpsc::UnboundedSender<WorkChunk>>,
    next_work: usize,

    staged: Vec<f64>,
    backlog: VecDeque<WorkChunk>,

    pending: HashMap<RequestId, PendingRequest>,
    next_request: RequestId,
}

impl Actor {
    fn new(
        config: Config,
        ops: mpsc::UnboundedReceiver<Op>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        status: watch::Sender<PoolStatus>,
    ) -> Self {
        Self {
            config,
            ops,
            inbound,
            status,
            peers: HashMap::new(),
            broadcast: BTreeMap::new(),
            work: BTreeMap::new(),
            next_work: 0,
            staged: Vec::new(),
            backlog: VecDeque::new(),
            pending: HashMap::new(),
            next_request: 1,
        }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(Op::Shutdown) | None => break,
                    Some(op) => self.handle_op(op).await,
                },
                Some(event) = self.inbound.recv() => self.handle_inbound(event).await,
                _ = sleep_until_deadline(deadline) => self.expire(Instant::now()),
            }
        }

        for (request, pending) in self.pending.drain() {
            debug!(request, kind = %pending.round.kind(), "Failing request on shutdown");
            let _ = pending.reply_to.send(Err(RoundError::Stopped));
        }
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::Submit { value, is_final } => {
                self.staged.push(value);
                if is_final || self.staged.len() >= self.config.flush_threshold() {
                    self.flush().await;
                }
            }
            Op::Request { kind, reply_to } => self.start_request(kind, reply_to),
            Op::Broadcast(command) => self.broadcast(command),
            Op::Shutdown => {}
        }
    }

    async fn handle_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Joined { peer, worker, link } => {
                debug!(peer, worker = %worker, channel = %link.kind(), "Peer joined");
                self.peers.insert(peer, (worker, link.kind()));
                match link {
                    PeerLink::Broadcast(tx) => {
                        self.broadcast.insert(peer, tx);
                    }
                    PeerLink::Work(tx) => {
                        self.work.insert(peer, tx);
                        self.drain_backlog().await;
                    }
                    PeerLink::Results => {}
                }
                self.publish_status();
            }
            Inbound::Left { peer, channel } => {
                if let Some((worker, _)) = self.peers.remove(&peer) {
                    warn!(peer, worker = %worker, channel = %channel, "Peer left");
                }
                self.broadcast.remove(&peer);
                self.work.remove(&peer);
                self.publish_status();
            }
            Inbound::Reply(reply) => self.handle_reply(reply),
        }
    }

    fn publish_status(&self) {
        let mut kinds: HashMap<&str, HashSet<ChannelKind>> = HashMap::new();
        for (worker, kind) in self.peers.values() {
            kinds.entry(worker.as_str()).or_default().insert(*kind);
        }

        let status = PoolStatus {
            ready: kinds.values().filter(|k| k.len() == 3).count(),
            broadcast_peers: self.broadcast.len(),
            work_peers: self.work.len(),
            result_peers: self.peers.values().filter(|(_, k)| *k == ChannelKind::Results).count(),
        };
        self.status.send_replace(status);
    }

    /// Split the staging buffer and hand the chunks out
    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.staged);
        if batch.is_empty() {
            return;
        }

        debug!(values = batch.len(), workers = self.config.pool.workers, "Flushing staged values");
        for chunk in split_batch(batch, self.config.pool.workers) {
            if chunk.is_empty() {
                continue;
            }
            self.pace().await;
            self.dispatch(chunk);
        }
    }

    async fn drain_backlog(&mut self) {
        let chunks: Vec<WorkChunk> = self.backlog.drain(..).collect();
        if !chunks.is_empty() {
            debug!(chunks = chunks.len(), "Dispatching backlog");
        }
        for chunk in chunks {
            self.pace().await;
            self.dispatch(chunk);
        }
    }

    async fn pace(&self) {
        if let Some(delay) = self.config.protocol.send_delay() {
            sleep(delay).await;
        }
    }

    /// Send a chunk to the next work peer, or keep it until one connects
    fn dispatch(&mut self, mut chunk: WorkChunk) {
        while !self.work.is_empty() {
            let index = self.next_work % self.work.len();
            self.next_work = self.next_work.wrapping_add(1);

            let Some((&peer, tx)) = self.work.iter().nth(index) else {
                break;
            };
            match tx.send(chunk) {
                Ok(()) => {
                    debug!(peer, "Chunk dispatched");
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    chunk = returned;
                    self.work.remove(&peer);
                }
            }
        }

        debug!(values = chunk.len(), "No work peer connected, holding chunk");
        self.backlog.push_back(chunk);
    }

    fn broadcast(&mut self, command: Command) {
        debug!(command = ?command, peers = self.broadcast.len(), "Broadcasting");
        self.broadcast.retain(|_, tx| tx.send(command.clone()).is_ok());
    }

    fn step_deadline(&self) -> Option<Instant> {
        self.config.protocol.round_timeout().map(|timeout| Instant::now() + timeout)
    }

    fn start_request(&mut self, kind: RequestKind, reply_to: oneshot::Sender<RoundResult>) {
        if self.pending.values().any(|p| p.round.kind() == kind) {
            let _ = reply_to.send(Err(RoundError::RequestInFlight(kind)));
            return;
        }

        let request = self.next_request;
        self.next_request += 1;

        let (round, command) = Round::start(
            kind,
            request,
            self.config.pool.workers,
            self.config.protocol.max_bisection_rounds,
        );
        info!(request, kind = %kind, "Request started");

        let deadline = self.step_deadline();
        self.pending.insert(request, PendingRequest { round, reply_to, deadline });
        self.broadcast(command);
    }

    fn handle_reply(&mut self, reply: Reply) {
        let request = reply.request();
        let step = match self.pending.get_mut(&request) {
            Some(pending) => pending.round.on_reply(&reply),
            None => {
                warn!(request, reply = reply.tag(), "Reply for unknown request");
                return;
            }
        };

        match step {
            Step::Waiting => {}
            Step::Broadcast(command) => {
                let deadline = self.step_deadline();
                if let Some(pending) = self.pending.get_mut(&request) {
                    pending.deadline = deadline;
                }
                self.broadcast(command);
            }
            Step::Done(result) => {
                if let Some(pending) = self.pending.remove(&request) {
                    match &result {
                        Ok(value) => info!(
                            request,
                            kind = %pending.round.kind(),
                            value,
                            bisections = ?pending.round.bisections(),
                            "Request completed"
                        ),
                        Err(e) => warn!(request, kind = %pending.round.kind(), error = %e, "Request failed"),
                    }
                    let _ = pending.reply_to.send(result);
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|p| p.deadline).min()
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for request in expired {
            if let Some(pending) = self.pending.remove(&request) {
                let error = RoundError::TimedOut {
                    request,
                    kind: pending.round.kind(),
                    pending: pending.round.pending(),
                };
                warn!(request, error = %error, "Request expired");
                let _ = pending.reply_to.send(Err(error));
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
