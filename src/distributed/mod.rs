//! Distributed statistics
//!
//! The data set is split across a pool of workers; the coordinator computes
//! the mean and the exact median without ever gathering the values back.
//!
//! # Architecture
//!
//! - **Coordinator**: stages submitted values, distributes chunks, drives request rounds
//! - **Node Service**: worker process wiring, connects to the coordinator's channels
//! - **Workers**: own one partition each and answer protocol commands
//!
//! # Modules
//!
//! - `protocol`: command/reply types, JSON bodies, length-prefixed framing
//! - `transport`: the broadcast, work and results channels over TCP or in-process
//! - `rounds`: average and median round state machines
//! - `worker`: partition owner and command handlers
//! - `node_service`: worker role entry point
//! - `coordinator`: coordinator actor and public API

pub mod coordinator;
pub mod node_service;
pub mod protocol;
pub mod rounds;
pub mod transport;
pub mod worker;

// Re-export key types
pub use protocol::{
    Bracket,
    BoundCounts,
    Command,
    EstimationDirection,
    PartialAverage,
    Reply,
    RequestId,
    WorkChunk,
};

pub use coordinator::{Coordinator, PoolStatus, RoundResult};
pub use node_service::NodeService;
pub use rounds::{RequestKind, RoundError};
pub use worker::Worker;
