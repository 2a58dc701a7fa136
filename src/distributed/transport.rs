//! Channel transport
//!
//! The protocol runs over three independent logical channels:
//!
//! - **broadcast** (coordinator → every worker): commands, at-most-once,
//!   a worker that is not subscribed when a command is published misses it
//! - **work** (coordinator → one worker per unit): data chunks, round-robin
//! - **results** (workers → coordinator): replies, many-to-one
//!
//! Both sides of the protocol only ever see typed `tokio::sync::mpsc` channels.
//! This module bridges those to TCP connections (one connection per worker per
//! channel, each opened with a `Hello` frame) or wires them up directly for an
//! in-process worker.

use crate::config::ChannelConfig;
use crate::distributed::protocol::*;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Coordinator-side identifier of one connection
pub type PeerId = u64;

/// Sending half the coordinator keeps for a connected peer
#[derive(Debug)]
pub enum PeerLink {
    Broadcast(mpsc::UnboundedSender<Command>),
    Work(mpsc::UnboundedSender<WorkChunk>),
    /// Replies from this peer arrive as `Inbound::Reply`
    Results,
}

impl PeerLink {
    pub fn kind(&self) -> ChannelKind {
        match self {
            PeerLink::Broadcast(_) => ChannelKind::Broadcast,
            PeerLink::Work(_) => ChannelKind::Work,
            PeerLink::Results => ChannelKind::Results,
        }
    }
}

/// Event delivered to the coordinator actor by the transport
#[derive(Debug)]
pub enum Inbound {
    /// A worker opened one of its channels
    Joined {
        peer: PeerId,
        worker: String,
        link: PeerLink,
    },

    /// A channel connection went away
    Left { peer: PeerId, channel: ChannelKind },

    /// A reply arrived on the results channel
    Reply(Reply),
}

/// The worker's ends of its three channels
#[derive(Debug)]
pub struct WorkerLinks {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub chunks: mpsc::UnboundedReceiver<WorkChunk>,
    pub replies: mpsc::UnboundedSender<Reply>,
}

/// Addresses the coordinator actually bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAddrs {
    pub broadcast: SocketAddr,
    pub work: SocketAddr,
    pub results: SocketAddr,
}

impl ChannelAddrs {
    /// Channel configuration pointing at these addresses
    pub fn to_config(&self) -> ChannelConfig {
        ChannelConfig {
            broadcast: self.broadcast.to_string(),
            work: self.work.to_string(),
            results: self.results.to_string(),
        }
    }
}

/// Allocates peer identifiers shared by TCP and in-process peers
#[derive(Debug, Default, Clone)]
pub struct PeerIds(Arc<AtomicU64>);

impl PeerIds {
    pub fn next(&self) -> PeerId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Coordinator-side TCP endpoints for the three channels
pub struct TcpHub {
    addrs: ChannelAddrs,
    acceptors: Vec<JoinHandle<()>>,
}

impl TcpHub {
    /// Bind all three channels and start accepting workers
    ///
    /// Fails if any of the listeners cannot be bound.
    pub async fn bind(
        channels: &ChannelConfig,
        inbound: mpsc::UnboundedSender<Inbound>,
        ids: PeerIds,
    ) -> Result<Self> {
        let (broadcast, work, results) = tokio::try_join!(
            bind_listener(&channels.broadcast, ChannelKind::Broadcast),
            bind_listener(&channels.work, ChannelKind::Work),
            bind_listener(&channels.results, ChannelKind::Results),
        )?;

        let addrs = ChannelAddrs {
            broadcast: broadcast.local_addr()?,
            work: work.local_addr()?,
            results: results.local_addr()?,
        };

        let acceptors = [
            (broadcast, ChannelKind::Broadcast),
            (work, ChannelKind::Work),
            (results, ChannelKind::Results),
        ]
        .into_iter()
        .map(|(listener, kind)| {
            tokio::spawn(accept_loop(listener, kind, inbound.clone(), ids.clone()))
        })
        .collect();

        Ok(Self { addrs, acceptors })
    }

    pub fn local_addrs(&self) -> ChannelAddrs {
        self.addrs
    }

    /// Stop accepting new connections
    pub fn shutdown(self) {
        for acceptor in self.acceptors {
            acceptor.abort();
        }
    }
}

async fn bind_listener(addr: &str, kind: ChannelKind) -> Result<TcpListener> {
    TcpListener::bind(addr).await
        .with_context(|| format!("Failed to bind {} channel on {}", kind, addr))
}

async fn accept_loop(
    listener: TcpListener,
    kind: ChannelKind,
    inbound: mpsc::UnboundedSender<Inbound>,
    ids: PeerIds,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(channel = %kind, error = %e, "Failed to accept connection");
                continue;
            }
        };

        let peer = ids.next();
        debug!(channel = %kind, peer, %addr, "Connection accepted");

        let inbound = inbound.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_peer(stream, kind, peer, &inbound).await {
                warn!(channel = %kind, peer, error = %format!("{:#}", e), "Peer connection failed");
            }
            let _ = inbound.send(Inbound::Left { peer, channel: kind });
        });
    }
}

/// Drive one accepted connection until either side goes away
async fn serve_peer(
    stream: TcpStream,
    kind: ChannelKind,
    peer: PeerId,
    inbound: &mpsc::UnboundedSender<Inbound>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let hello: Hello = read_frame(&mut read_half).await?
        .context("Peer closed before sending hello")?;
    info!(channel = %kind, peer, worker = %hello.worker, "Worker joined");

    match kind {
        ChannelKind::Broadcast => {
            let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
            if inbound.send(Inbound::Joined { peer, worker: hello.worker, link: PeerLink::Broadcast(tx) }).is_err() {
                return Ok(());
            }

            let mut scratch = [0u8; 1];
            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(command) => write_frame(&mut write_half, &command).await?,
                        None => break,
                    },
                    // Workers never write on this channel; any read result means it is gone
                    _ = read_half.read(&mut scratch) => break,
                }
            }
        }
        ChannelKind::Work => {
            let (tx, mut rx) = mpsc::unbounded_channel::<WorkChunk>();
            if inbound.send(Inbound::Joined { peer, worker: hello.worker, link: PeerLink::Work(tx) }).is_err() {
                return Ok(());
            }

            let mut scratch = [0u8; 1];
            loop {
                tokio::select! {
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => write_frame(&mut write_half, &chunk).await?,
                        None => break,
                    },
                    _ = read_half.read(&mut scratch) => break,
                }
            }
        }
        ChannelKind::Results => {
            if inbound.send(Inbound::Joined { peer, worker: hello.worker, link: PeerLink::Results }).is_err() {
                return Ok(());
            }

            while let Some(reply) = read_frame::<_, Reply>(&mut read_half).await? {
                if inbound.send(Inbound::Reply(reply)).is_err() {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Connect a worker to the coordinator's three channels
///
/// Retries refused connections until `connect_timeout` elapses, so workers may
/// be started before the coordinator. Returns the worker's links and the I/O
/// tasks bridging them to the sockets.
pub async fn connect_worker(
    channels: &ChannelConfig,
    worker: &str,
    connect_timeout: Duration,
) -> Result<(WorkerLinks, Vec<JoinHandle<()>>)> {
    let hello = Hello { worker: worker.to_string() };

    let mut broadcast = connect_with_retry(&channels.broadcast, ChannelKind::Broadcast, connect_timeout).await?;
    let mut work = connect_with_retry(&channels.work, ChannelKind::Work, connect_timeout).await?;
    let mut results = connect_with_retry(&channels.results, ChannelKind::Results, connect_timeout).await?;

    write_frame(&mut broadcast, &hello).await?;
    write_frame(&mut work, &hello).await?;
    write_frame(&mut results, &hello).await?;

    let (command_tx, commands) = mpsc::unbounded_channel::<Command>();
    let (chunk_tx, chunks) = mpsc::unbounded_channel::<WorkChunk>();
    let (replies, mut reply_rx) = mpsc::unbounded_channel::<Reply>();

    let command_reader = tokio::spawn(async move {
        loop {
            match read_frame::<_, Command>(&mut broadcast).await {
                Ok(Some(command)) => {
                    if command_tx.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(channel = %ChannelKind::Broadcast, error = %format!("{:#}", e), "Dropping channel");
                    break;
                }
            }
        }
    });

    let chunk_reader = tokio::spawn(async move {
        loop {
            match read_frame::<_, WorkChunk>(&mut work).await {
                Ok(Some(chunk)) => {
                    if chunk_tx.send(chunk).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(channel = %ChannelKind::Work, error = %format!("{:#}", e), "Dropping channel");
                    break;
                }
            }
        }
    });

    let reply_writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = write_frame(&mut results, &reply).await {
                warn!(channel = %ChannelKind::Results, error = %format!("{:#}", e), "Dropping channel");
                break;
            }
        }
    });

    Ok((
        WorkerLinks { commands, chunks, replies },
        vec![command_reader, chunk_reader, reply_writer],
    ))
}

async fn connect_with_retry(addr: &str, kind: ChannelKind, timeout: Duration) -> Result<TcpStream> {
    let started = Instant::now();

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(channel = %kind, %addr, "Connected");
                return Ok(stream);
            }
            Err(e) if started.elapsed() < timeout => {
                debug!(channel = %kind, %addr, error = %e, "Connect failed, retrying");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to connect {} channel to {}", kind, addr));
            }
        }
    }
}

/// Wire an in-process worker straight into the coordinator's event stream
///
/// The worker gets direct channel ends; its replies are forwarded as
/// `Inbound::Reply` by a small task that reports the results channel as left
/// once the worker drops its sender.
pub fn attach_local(
    inbound: &mpsc::UnboundedSender<Inbound>,
    ids: &PeerIds,
    worker: &str,
) -> Result<WorkerLinks> {
    let (command_tx, commands) = mpsc::unbounded_channel::<Command>();
    let (chunk_tx, chunks) = mpsc::unbounded_channel::<WorkChunk>();
    let (replies, mut reply_rx) = mpsc::unbounded_channel::<Reply>();

    let joins = [
        PeerLink::Broadcast(command_tx),
        PeerLink::Work(chunk_tx),
        PeerLink::Results,
    ];

    let mut results_peer = 0;
    for link in joins {
        let peer = ids.next();
        if matches!(link, PeerLink::Results) {
            results_peer = peer;
        }
        inbound
            .send(Inbound::Joined { peer, worker: worker.to_string(), link })
            .map_err(|_| anyhow::anyhow!("Coordinator is not running"))?;
    }

    let forward = inbound.clone();
    tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if forward.send(Inbound::Reply(reply)).is_err() {
                return;
            }
        }
        let _ = forward.send(Inbound::Left { peer: results_peer, channel: ChannelKind::Results });
    });

    Ok(WorkerLinks { commands, chunks, replies })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> ChannelConfig {
        ChannelConfig {
            broadcast: "127.0.0.1:0".to_string(),
            work: "127.0.0.1:0".to_string(),
            results: "127.0.0.1:0".to_string(),
        }
    }

    async fn next_joined(rx: &mut mpsc::UnboundedReceiver<Inbound>) -> (String, PeerLink) {
        loop {
            match rx.recv().await.expect("inbound closed") {
                Inbound::Joined { worker, link, .. } => return (worker, link),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_attach_local_announces_three_channels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ids = PeerIds::default();

        let links = attach_local(&tx, &ids, "WORKER-local").unwrap();

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let (worker, link) = next_joined(&mut rx).await;
            assert_eq!(worker, "WORKER-local");
            kinds.push(link.kind());
        }
        assert_eq!(kinds, vec![ChannelKind::Broadcast, ChannelKind::Work, ChannelKind::Results]);

        links.replies.send(Reply::Sort { request: 1, data: SortAck { sorted: true } }).unwrap();
        match rx.recv().await.unwrap() {
            Inbound::Reply(reply) => assert_eq!(reply.request(), 1),
            other => panic!("Unexpected event: {:?}", other),
        }

        drop(links);
        match rx.recv().await.unwrap() {
            Inbound::Left { channel, .. } => assert_eq!(channel, ChannelKind::Results),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_channels_carry_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = TcpHub::bind(&loopback(), tx, PeerIds::default()).await.unwrap();
        let channels = hub.local_addrs().to_config();

        let (mut links, io_tasks) = connect_worker(&channels, "WORKER-tcp", Duration::from_secs(5))
            .await
            .unwrap();

        let mut commands = None;
        let mut chunks = None;
        for _ in 0..3 {
            let (worker, link) = next_joined(&mut rx).await;
            assert_eq!(worker, "WORKER-tcp");
            match link {
                PeerLink::Broadcast(tx) => commands = Some(tx),
                PeerLink::Work(tx) => chunks = Some(tx),
                PeerLink::Results => {}
            }
        }

        chunks.unwrap().send(vec![3.0, 1.0, 2.0]).unwrap();
        commands.unwrap().send(Command::Sort { request: 5 }).unwrap();

        assert_eq!(links.chunks.recv().await, Some(vec![3.0, 1.0, 2.0]));
        assert_eq!(links.commands.recv().await, Some(Command::Sort { request: 5 }));

        links.replies.send(Reply::Sort { request: 5, data: SortAck { sorted: true } }).unwrap();
        loop {
            if let Inbound::Reply(reply) = rx.recv().await.unwrap() {
                assert_eq!(reply, Reply::Sort { request: 5, data: SortAck { sorted: true } });
                break;
            }
        }

        for task in io_tasks {
            task.abort();
        }
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let hub = TcpHub::bind(&loopback(), tx.clone(), PeerIds::default()).await.unwrap();

        // Reuse an address that is already bound
        let mut taken = loopback();
        taken.results = hub.local_addrs().results.to_string();

        assert!(TcpHub::bind(&taken, tx, PeerIds::default()).await.is_err());
        hub.shutdown();
    }
}
