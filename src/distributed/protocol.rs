//! Coordinator/worker protocol
//!
//! This module defines every message exchanged between the coordinator and the
//! workers, and the framing used to carry them over a byte stream.
//!
//! # Channels
//!
//! ```text
//! Coordinator                         Worker
//!     |                                  |
//!     |== broadcast: Command ===========>|   (every worker)
//!     |== work: WorkChunk ==============>|   (exactly one worker per chunk)
//!     |<========= results: Reply ========|   (many-to-one)
//! ```
//!
//! # Median request
//!
//! ```text
//!     |-- SORT ------------------------->|
//!     |<--------------- SORT {sorted} ---|
//!     |-- COMPUTE_LOCAL_MEDIAN --------->|
//!     |<----- COMPUTE_LOCAL_MEDIAN m ----|
//!     |-- COMPUTE_BOUND_COUNTS(p) ------>|   repeated while the pivot moves
//!     |<---- COMPUTE_BOUND_COUNTS {..} --|
//!     |-- COMPUTE_BRACKET(p, dir) ------>|
//!     |<-------- COMPUTE_BRACKET {..} ---|
//! ```
//!
//! # Encoding
//!
//! Bodies are JSON; the field names (`type`, `data`, `pivot`, `direction`,
//! `lowerCount`, `upperCount`, `first`, `second`, `len`, `avg`) are part of the
//! wire contract. Each body is prefixed with a 4-byte length field
//! (little-endian u32):
//!
//! ```text
//! [4 bytes: body length][N bytes: JSON body]
//! ```

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body (64 MiB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Identifier of one coordinator request, echoed by every reply it causes
pub type RequestId = u64;

/// One unit on the work-distribution channel
pub type WorkChunk = Vec<f64>;

/// Where the median lies relative to the pivot once bound counts converge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EstimationDirection {
    /// Not yet estimated
    #[default]
    None,

    /// Median is the smallest value strictly above the pivot
    TowardUpper,

    /// Median is the largest value at or below the pivot
    TowardLower,

    /// Median is the pivot itself, or the midpoint of the values around it
    Equal,
}

/// Command broadcast to every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Sort the local partition ascending
    Sort { request: RequestId },

    /// Report the median of the (sorted) local partition
    ComputeLocalMedian { request: RequestId },

    /// Count local elements below, above and equal to `pivot`
    ComputeBoundCounts { request: RequestId, pivot: f64 },

    /// Report the local values bracketing `pivot`, per `direction`
    ComputeBracket {
        request: RequestId,
        pivot: f64,
        direction: EstimationDirection,
    },

    /// Report `(count, mean)` of the local partition
    ComputeAverage { request: RequestId },

    /// Log the local partition (debugging only, no reply)
    DumpLocalCache,

    /// Clear the local partition (debugging only, no reply)
    ResetLocalCache,
}

impl Command {
    /// Request this command belongs to, if it expects a reply
    pub fn request(&self) -> Option<RequestId> {
        match self {
            Command::Sort { request }
            | Command::ComputeLocalMedian { request }
            | Command::ComputeBoundCounts { request, .. }
            | Command::ComputeBracket { request, .. }
            | Command::ComputeAverage { request } => Some(*request),
            Command::DumpLocalCache | Command::ResetLocalCache => None,
        }
    }
}

/// Sort acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortAck {
    pub sorted: bool,
}

/// Element counts relative to a pivot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundCounts {
    /// Elements strictly below the pivot
    pub lower_count: u64,

    /// Elements strictly above the pivot
    pub upper_count: u64,

    /// Elements equal to the pivot
    #[serde(default)]
    pub equal_count: u64,
}

impl BoundCounts {
    /// Add another worker's counts
    pub fn accumulate(&mut self, other: &BoundCounts) {
        self.lower_count += other.lower_count;
        self.upper_count += other.upper_count;
        self.equal_count += other.equal_count;
    }

    /// Total number of elements counted
    pub fn total(&self) -> u64 {
        self.lower_count + self.upper_count + self.equal_count
    }
}

/// Values around a pivot reported by one worker; `None` means no contribution
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bracket {
    pub first: Option<f64>,
    pub second: Option<f64>,
}

/// Partition size and mean
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialAverage {
    pub len: u64,
    pub avg: f64,
}

/// Reply sent by a worker on the result-aggregation channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    Sort { request: RequestId, data: SortAck },

    /// `None` when the partition is empty
    ComputeLocalMedian { request: RequestId, data: Option<f64> },

    ComputeBoundCounts { request: RequestId, data: BoundCounts },

    ComputeBracket { request: RequestId, data: Bracket },

    ComputeAverage { request: RequestId, data: PartialAverage },
}

impl Reply {
    /// Request this reply answers
    pub fn request(&self) -> RequestId {
        match self {
            Reply::Sort { request, .. }
            | Reply::ComputeLocalMedian { request, .. }
            | Reply::ComputeBoundCounts { request, .. }
            | Reply::ComputeBracket { request, .. }
            | Reply::ComputeAverage { request, .. } => *request,
        }
    }

    /// Wire tag of this reply
    pub fn tag(&self) -> &'static str {
        match self {
            Reply::Sort { .. } => "SORT",
            Reply::ComputeLocalMedian { .. } => "COMPUTE_LOCAL_MEDIAN",
            Reply::ComputeBoundCounts { .. } => "COMPUTE_BOUND_COUNTS",
            Reply::ComputeBracket { .. } => "COMPUTE_BRACKET",
            Reply::ComputeAverage { .. } => "COMPUTE_AVERAGE",
        }
    }
}

/// First frame a worker sends on each of its three connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Worker name, used only for logging
    pub worker: String,
}

/// Logical channel a connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Broadcast,
    Work,
    Results,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Broadcast => write!(f, "broadcast"),
            ChannelKind::Work => write!(f, "work"),
            ChannelKind::Results => write!(f, "results"),
        }
    }
}

/// Serialize a message into a length-prefixed frame
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)
        .context("Failed to serialize message")?;

    if body.len() > MAX_FRAME_LEN {
        anyhow::bail!("Message too large: {} bytes (max {})", body.len(), MAX_FRAME_LEN);
    }

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);

    Ok(framed)
}

/// Read one frame from a stream
///
/// Returns `Ok(None)` on a clean end of stream before any byte of a new frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame length"),
    }

    let body_len = u32::from_le_bytes(len_buf) as usize;
    if body_len > MAX_FRAME_LEN {
        anyhow::bail!("Frame too large: {} bytes (max {})", body_len, MAX_FRAME_LEN);
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await
        .context("Failed to read frame body")?;

    let msg = serde_json::from_slice(&body)
        .context("Failed to deserialize message")?;

    Ok(Some(msg))
}

/// Write one frame to a stream and flush it
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = encode_frame(msg)?;

    writer.write_all(&framed).await
        .context("Failed to write frame")?;
    writer.flush().await
        .context("Failed to flush stream")?;

    Ok(())
}
