//! Request round state machines
//!
//! Each coordinator request owns one round object. A round is fed replies in
//! whatever order they arrive and tells the coordinator what to do next:
//! keep waiting, broadcast the next command, or finish with a result. Steps
//! complete when `workers` replies of the expected type have been counted;
//! replies are tracked by count, not by sender.
//!
//! # Median
//!
//! The exact median is found without collecting the data set:
//!
//! 1. `SORT` every partition.
//! 2. `COMPUTE_LOCAL_MEDIAN`: the median of the partition medians is the first
//!    pivot, their min/max bound the search interval. The global median always
//!    lies inside that interval.
//! 3. `COMPUTE_BOUND_COUNTS(pivot)`: sum the per-worker counts below, above and
//!    equal to the pivot. If the middle rank(s) of the whole data set are
//!    pinned by the pivot or its immediate neighbours the counts have
//!    converged; otherwise bisect the interval toward the heavier side and
//!    count again. Bisection halves the number of representable `f64` values
//!    left in the interval, not its width, so a search spanning any range of
//!    magnitudes needs at most about 64 counts.
//! 4. `COMPUTE_BRACKET(pivot, direction)`: collect the neighbouring values each
//!    worker holds and reduce them to the exact median.

use crate::distributed::protocol::*;
use crate::stats::{self, StatsError, WeightedMean};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Kind of statistic a request computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Average,
    Median,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Average => write!(f, "average"),
            RequestKind::Median => write!(f, "median"),
        }
    }
}

/// Why a request did not produce a result
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoundError {
    #[error("a {0} request is already in flight")]
    RequestInFlight(RequestKind),

    #[error("{kind} request {request} timed out waiting for {pending} worker replies")]
    TimedOut {
        request: RequestId,
        kind: RequestKind,
        pending: usize,
    },

    #[error("the workers hold no data")]
    EmptyDataSet,

    #[error("median bisection did not converge after {rounds} rounds")]
    NotConverged { rounds: u32 },

    #[error("workers reported no values around pivot {pivot}")]
    MissingBracket { pivot: f64 },

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error("coordinator stopped")]
    Stopped,
}

/// What the coordinator should do after feeding a reply to a round
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// More replies are needed for the current command
    Waiting,

    /// Broadcast this command; a full set of replies is expected again
    Broadcast(Command),

    /// The round is over
    Done(Result<f64, RoundError>),
}

/// Reply counter for one step
#[derive(Debug, Clone, Copy)]
struct ReplyCounter {
    workers: usize,
    pending: usize,
}

impl ReplyCounter {
    fn new(workers: usize) -> Self {
        Self { workers, pending: workers }
    }

    /// Count one reply; true when the step is complete (and the counter rearmed)
    fn ack(&mut self) -> bool {
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            self.pending = self.workers;
            true
        } else {
            false
        }
    }
}

/// Average request: one `COMPUTE_AVERAGE` step
#[derive(Debug, Clone)]
pub struct AverageRound {
    request: RequestId,
    counter: ReplyCounter,
    accumulator: WeightedMean,
}

impl AverageRound {
    /// Start a round, returning it with the command to broadcast
    pub fn start(request: RequestId, workers: usize) -> (Self, Command) {
        let round = Self {
            request,
            counter: ReplyCounter::new(workers),
            accumulator: WeightedMean::new(),
        };
        (round, Command::ComputeAverage { request })
    }

    pub fn on_reply(&mut self, reply: &Reply) -> Step {
        let Reply::ComputeAverage { data, .. } = reply else {
            warn!(request = self.request, reply = reply.tag(), "Ignoring reply not expected by average round");
            return Step::Waiting;
        };

        self.accumulator.combine(data.len, data.avg);
        if !self.counter.ack() {
            return Step::Waiting;
        }

        debug!(request = self.request, values = self.accumulator.count, "Averages combined");
        if self.accumulator.is_empty() {
            Step::Done(Err(RoundError::EmptyDataSet))
        } else {
            Step::Done(Ok(self.accumulator.mean))
        }
    }
}

/// Current bisection interval and pivot
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MedianEstimate {
    pub value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl MedianEstimate {
    /// Initial estimate from the partition medians
    pub fn from_local_medians(medians: &[f64]) -> Result<Self, StatsError> {
        let value = stats::median(medians, false)?;
        let lower_bound = medians.iter().copied().fold(f64::INFINITY, f64::min);
        let upper_bound = medians.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Ok(Self { value, lower_bound, upper_bound })
    }

    /// Move the pivot halfway toward the side holding more elements
    pub fn narrow(&mut self, counts: &BoundCounts) {
        if counts.lower_count > counts.upper_count {
            self.upper_bound = self.value;
            self.value = ordered_midpoint(self.lower_bound, self.value);
        } else {
            self.lower_bound = self.value;
            self.value = ordered_midpoint(self.value, self.upper_bound);
        }
    }
}

/// Map a float onto a `u64` whose unsigned order is the numeric order
fn order_key(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | 1 << 63
    }
}

fn from_order_key(key: u64) -> f64 {
    if key >> 63 == 1 {
        f64::from_bits(key & !(1 << 63))
    } else {
        f64::from_bits(!key)
    }
}

/// Float halfway between `a` and `b` counted in representable values
///
/// Between 1e-300 and 1e300 this lands near 1, not near 5e299.
pub fn ordered_midpoint(a: f64, b: f64) -> f64 {
    let (ka, kb) = (order_key(a), order_key(b));
    let (low, high) = (ka.min(kb), ka.max(kb));
    from_order_key(low + (high - low) / 2)
}

/// Converged bound counts: which bracket to request and how to read it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convergence {
    pub direction: EstimationDirection,

    /// The median is the mean of the pivot and the reduced bracket value
    pub with_pivot: bool,
}

impl Convergence {
    fn new(direction: EstimationDirection) -> Self {
        Self { direction, with_pivot: false }
    }
}

/// Decide whether summed bound counts pin the median at the pivot
///
/// With `N` elements the median sits at rank `(N-1)/2` (and `N/2` for even
/// `N`). A bracket can read back the ranks held by the pivot itself, the
/// nearest value above it, and (when the pivot is not a data value) the
/// nearest value below it. Counts converge when both middle ranks are among
/// those.
pub fn classify(counts: &BoundCounts) -> Option<Convergence> {
    let total = counts.total();
    if total == 0 {
        return None;
    }

    let (low_rank, high_rank) = ((total - 1) / 2, total / 2);
    let below = counts.lower_count;
    let through = below + counts.equal_count;

    let first_readable = if counts.equal_count == 0 { below.saturating_sub(1) } else { below };
    if low_rank < first_readable || high_rank > through {
        return None;
    }

    if counts.equal_count > 0 {
        if high_rank < through {
            // Both middle ranks hold the pivot value
            Some(Convergence::new(EstimationDirection::Equal))
        } else if low_rank == through {
            Some(Convergence::new(EstimationDirection::TowardUpper))
        } else {
            // Pivot is the lower middle value, its successor the upper one
            Some(Convergence {
                direction: EstimationDirection::TowardUpper,
                with_pivot: true,
            })
        }
    } else if low_rank == high_rank {
        if low_rank < below {
            Some(Convergence::new(EstimationDirection::TowardLower))
        } else {
            Some(Convergence::new(EstimationDirection::TowardUpper))
        }
    } else {
        // Pivot sits strictly between the two middle values
        Some(Convergence::new(EstimationDirection::Equal))
    }
}

/// Reduce the collected bracket values to the median
pub fn reduce_bracket(candidates: &mut [f64], pivot: f64, direction: EstimationDirection) -> Option<f64> {
    candidates.sort_by(f64::total_cmp);

    match direction {
        EstimationDirection::TowardLower => candidates.last().copied(),
        EstimationDirection::TowardUpper => candidates.first().copied(),
        EstimationDirection::Equal => {
            if candidates.iter().any(|c| *c == pivot) {
                return Some(pivot);
            }
            let above = candidates.iter().position(|c| *c > pivot)?;
            let below = above.checked_sub(1)?;
            Some(stats::midpoint(candidates[below], candidates[above]))
        }
        EstimationDirection::None => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MedianPhase {
    Sorting,
    LocalMedians,
    BoundCounts,
    Snap,
    Bracket,
}

/// Median request: sort, local medians, bisection, bracket
///
/// Bisection alone only approaches a duplicated median value without landing
/// on it, so every bisection count that does not converge is followed by a
/// snap: a `COMPUTE_BRACKET` toward the median side that moves the next pivot
/// onto the nearest data value, which is counted before bisecting again.
#[derive(Debug, Clone)]
pub struct MedianRound {
    request: RequestId,
    counter: ReplyCounter,
    phase: MedianPhase,
    local_medians: Vec<f64>,
    estimate: MedianEstimate,
    counts: BoundCounts,
    convergence: Option<Convergence>,
    snap_direction: EstimationDirection,
    snapped: bool,
    candidates: Vec<f64>,
    bisections: u32,
    max_bisections: u32,
}

impl MedianRound {
    /// Start a round, returning it with the command to broadcast
    pub fn start(request: RequestId, workers: usize, max_bisections: u32) -> (Self, Command) {
        let round = Self {
            request,
            counter: ReplyCounter::new(workers),
            phase: MedianPhase::Sorting,
            local_medians: Vec::with_capacity(workers),
            estimate: MedianEstimate::default(),
            counts: BoundCounts::default(),
            convergence: None,
            snap_direction: EstimationDirection::None,
            snapped: false,
            candidates: Vec::new(),
            bisections: 0,
            max_bisections,
        };
        (round, Command::Sort { request })
    }

    /// Direction the counts converged with, `None` until they do
    pub fn direction(&self) -> EstimationDirection {
        self.convergence
            .map(|c| c.direction)
            .unwrap_or_default()
    }

    /// Number of bound-count rounds broadcast so far
    pub fn bisections(&self) -> u32 {
        self.bisections
    }

    pub fn on_reply(&mut self, reply: &Reply) -> Step {
        match (self.phase, reply) {
            (MedianPhase::Sorting, Reply::Sort { .. }) => {
                if !self.counter.ack() {
                    return Step::Waiting;
                }
                self.phase = MedianPhase::LocalMedians;
                Step::Broadcast(Command::ComputeLocalMedian { request: self.request })
            }
            (MedianPhase::LocalMedians, Reply::ComputeLocalMedian { data, .. }) => {
                if let Some(median) = data {
                    self.local_medians.push(*median);
                }
                if !self.counter.ack() {
                    return Step::Waiting;
                }
                self.start_bisection()
            }
            (MedianPhase::BoundCounts, Reply::ComputeBoundCounts { data, .. }) => {
                self.counts.accumulate(data);
                if !self.counter.ack() {
                    return Step::Waiting;
                }
                self.evaluate_counts()
            }
            (MedianPhase::Snap, Reply::ComputeBracket { data, .. }) => {
                self.collect(data);
                if !self.counter.ack() {
                    return Step::Waiting;
                }
                self.snap()
            }
            (MedianPhase::Bracket, Reply::ComputeBracket { data, .. }) => {
                self.collect(data);
                if !self.counter.ack() {
                    return Step::Waiting;
                }
                self.finish()
            }
            (phase, reply) => {
                warn!(
                    request = self.request,
                    phase = ?phase,
                    reply = reply.tag(),
                    "Ignoring reply not expected in this median step"
                );
                Step::Waiting
            }
        }
    }

    fn collect(&mut self, bracket: &Bracket) {
        self.candidates.extend(bracket.first);
        self.candidates.extend(bracket.second);
    }

    fn start_bisection(&mut self) -> Step {
        if self.local_medians.is_empty() {
            return Step::Done(Err(RoundError::EmptyDataSet));
        }

        self.estimate = match MedianEstimate::from_local_medians(&self.local_medians) {
            Ok(estimate) => estimate,
            Err(e) => return Step::Done(Err(e.into())),
        };
        debug!(
            request = self.request,
            estimate = self.estimate.value,
            lower = self.estimate.lower_bound,
            upper = self.estimate.upper_bound,
            "Median of local medians"
        );

        self.count_at_estimate()
    }

    fn count_at_estimate(&mut self) -> Step {
        self.phase = MedianPhase::BoundCounts;
        self.counts = BoundCounts::default();
        self.bisections += 1;
        Step::Broadcast(Command::ComputeBoundCounts {
            request: self.request,
            pivot: self.estimate.value,
        })
    }

    fn evaluate_counts(&mut self) -> Step {
        debug!(
            request = self.request,
            pivot = self.estimate.value,
            below = self.counts.lower_count,
            above = self.counts.upper_count,
            equal = self.counts.equal_count,
            "Bound counts"
        );

        if let Some(convergence) = classify(&self.counts) {
            self.convergence = Some(convergence);
            self.phase = MedianPhase::Bracket;
            self.candidates.clear();
            return Step::Broadcast(Command::ComputeBracket {
                request: self.request,
                pivot: self.estimate.value,
                direction: convergence.direction,
            });
        }

        if self.bisections >= self.max_bisections {
            return Step::Done(Err(RoundError::NotConverged { rounds: self.bisections }));
        }

        let pivot = self.estimate.value;
        let toward_lower = self.counts.lower_count > self.counts.upper_count;
        self.estimate.narrow(&self.counts);

        if !std::mem::take(&mut self.snapped) {
            // Largest value at or below a pivot that is itself a data value is the pivot
            let direction = if !toward_lower {
                Some(EstimationDirection::TowardUpper)
            } else if self.counts.equal_count == 0 {
                Some(EstimationDirection::TowardLower)
            } else {
                None
            };

            if let Some(direction) = direction {
                self.phase = MedianPhase::Snap;
                self.snap_direction = direction;
                self.candidates.clear();
                return Step::Broadcast(Command::ComputeBracket {
                    request: self.request,
                    pivot,
                    direction,
                });
            }
        }

        if order_key(self.estimate.value) == order_key(pivot) {
            // Interval collapsed onto a float with no representable midpoint
            return Step::Done(Err(RoundError::NotConverged { rounds: self.bisections }));
        }
        self.count_at_estimate()
    }

    fn snap(&mut self) -> Step {
        let MedianEstimate { value, lower_bound, upper_bound } = self.estimate;
        let nearest = reduce_bracket(&mut self.candidates, value, self.snap_direction);
        self.candidates.clear();

        match nearest {
            Some(v) if (lower_bound..=upper_bound).contains(&v) => {
                debug!(request = self.request, pivot = v, "Snapped pivot to data value");
                self.estimate.value = v;
                self.snapped = true;
            }
            _ if value == lower_bound || value == upper_bound => {
                return Step::Done(Err(RoundError::NotConverged { rounds: self.bisections }));
            }
            _ => {}
        }
        self.count_at_estimate()
    }

    fn finish(&mut self) -> Step {
        let pivot = self.estimate.value;
        let Some(convergence) = self.convergence else {
            return Step::Done(Err(RoundError::MissingBracket { pivot }));
        };
        debug!(
            request = self.request,
            pivot,
            direction = ?self.direction(),
            candidates = self.candidates.len(),
            bisections = self.bisections,
            "Reducing bracket"
        );

        match reduce_bracket(&mut self.candidates, pivot, convergence.direction) {
            Some(median) if convergence.with_pivot => Step::Done(Ok(stats::midpoint(pivot, median))),
            Some(median) => Step::Done(Ok(median)),
            None => Step::Done(Err(RoundError::MissingBracket { pivot })),
        }
    }
}

/// Round state of one in-flight request
#[derive(Debug, Clone)]
pub enum Round {
    Average(AverageRound),
    Median(MedianRound),
}

impl Round {
    /// Start a round of the given kind, returning it with its first command
    pub fn start(kind: RequestKind, request: RequestId, workers: usize, max_bisections: u32) -> (Self, Command) {
        match kind {
            RequestKind::Average => {
                let (round, command) = AverageRound::start(request, workers);
                (Round::Average(round), command)
            }
            RequestKind::Median => {
                let (round, command) = MedianRound::start(request, workers, max_bisections);
                (Round::Median(round), command)
            }
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Round::Average(_) => RequestKind::Average,
            Round::Median(_) => RequestKind::Median,
        }
    }

    /// Bound-count rounds a median request has used so far
    pub fn bisections(&self) -> Option<u32> {
        match self {
            Round::Average(_) => None,
            Round::Median(round) => Some(round.bisections()),
        }
    }

    pub fn pending(&self) -> usize {
        match self {
            Round::Average(round) => round.counter.pending,
            Round::Median(round) => round.counter.pending,
        }
    }

    pub fn on_reply(&mut self, reply: &Reply) -> Step {
        match self {
            Round::Average(round) => round.on_reply(reply),
            Round::Median(round) => round.on_reply(reply),
        }
    }
}
