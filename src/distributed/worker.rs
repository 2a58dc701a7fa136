//! Worker
//!
//! A worker owns one partition of the data set and answers coordinator
//! commands against it. All work happens on a single task: chunks from the
//! work channel and commands from the broadcast channel are handled one at a
//! time, so the partition is never touched concurrently.
//!
//! The median handlers work on the sorted partition. `SORT` normally takes
//! care of that; a chunk that lands after it marks the partition unsorted and
//! the next median command sorts again.

use crate::distributed::protocol::*;
use crate::distributed::transport::WorkerLinks;
use crate::stats;
use anyhow::Result;
use tracing::{debug, info, warn};

/// Partition owner and command handler
#[derive(Debug, Default)]
pub struct Worker {
    name: String,
    partition: Vec<f64>,
    sorted: bool,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: Vec::new(),
            sorted: true,
        }
    }

    /// Append a chunk received on the work channel
    pub fn extend(&mut self, chunk: WorkChunk) {
        debug!(worker = %self.name, values = chunk.len(), "Received chunk");
        self.sorted = self.sorted && chunk.is_empty();
        self.partition.extend(chunk);
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            self.partition.sort_by(f64::total_cmp);
            self.sorted = true;
        }
    }

    /// Execute one command, returning the reply to send back (if any)
    pub fn handle(&mut self, command: Command) -> Option<Reply> {
        match command {
            Command::Sort { request } => {
                self.ensure_sorted();
                Some(Reply::Sort { request, data: SortAck { sorted: true } })
            }
            Command::ComputeLocalMedian { request } => {
                self.ensure_sorted();
                let median = self.local_median();
                info!(worker = %self.name, median = ?median, "[MEDIAN]");
                Some(Reply::ComputeLocalMedian { request, data: median })
            }
            Command::ComputeBoundCounts { request, pivot } => {
                self.ensure_sorted();
                Some(Reply::ComputeBoundCounts { request, data: self.bound_counts(pivot) })
            }
            Command::ComputeBracket { request, pivot, direction } => {
                self.ensure_sorted();
                Some(Reply::ComputeBracket { request, data: self.bracket(pivot, direction) })
            }
            Command::ComputeAverage { request } => {
                Some(Reply::ComputeAverage { request, data: self.average() })
            }
            Command::DumpLocalCache => {
                info!(worker = %self.name, len = self.partition.len(), partition = ?self.partition, "Local cache");
                None
            }
            Command::ResetLocalCache => {
                self.partition.clear();
                self.sorted = true;
                debug!(worker = %self.name, "Local cache reset");
                None
            }
        }
    }

    fn local_median(&self) -> Option<f64> {
        if self.partition.is_empty() {
            return None;
        }
        match stats::median(&self.partition, true) {
            Ok(median) => Some(median),
            Err(e) => {
                warn!(worker = %self.name, error = %e, "Local median unavailable");
                None
            }
        }
    }

    /// Index of the first element equal to or above `pivot`
    fn first_not_below(&self, pivot: f64) -> usize {
        self.partition.partition_point(|v| *v < pivot)
    }

    /// Index of the first element strictly above `pivot`
    fn first_above(&self, pivot: f64) -> usize {
        self.partition.partition_point(|v| *v <= pivot)
    }

    fn bound_counts(&self, pivot: f64) -> BoundCounts {
        let below = self.first_not_below(pivot);
        let above_start = self.first_above(pivot);

        BoundCounts {
            lower_count: below as u64,
            upper_count: (self.partition.len() - above_start) as u64,
            equal_count: (above_start - below) as u64,
        }
    }

    fn bracket(&self, pivot: f64, direction: EstimationDirection) -> Bracket {
        let above_start = self.first_above(pivot);
        let first_above = self.partition.get(above_start).copied();

        match direction {
            EstimationDirection::TowardUpper => Bracket { first: first_above, second: None },
            EstimationDirection::TowardLower => {
                // Predecessor of the first greater element, or the last element when none is greater
                let at_or_below = above_start.checked_sub(1).map(|i| self.partition[i]);
                Bracket { first: at_or_below, second: None }
            }
            EstimationDirection::Equal => {
                let below = self.first_not_below(pivot);
                if below < above_start {
                    Bracket { first: Some(pivot), second: None }
                } else {
                    let predecessor = below.checked_sub(1).map(|i| self.partition[i]);
                    Bracket { first: predecessor, second: first_above }
                }
            }
            EstimationDirection::None => {
                warn!(worker = %self.name, "Bracket requested without an estimation direction");
                Bracket::default()
            }
        }
    }

    fn average(&self) -> PartialAverage {
        if self.partition.is_empty() {
            return PartialAverage { len: 0, avg: 0.0 };
        }

        let avg = stats::mean(&self.partition).unwrap_or_else(|e| {
            warn!(worker = %self.name, error = %e, "Local mean unavailable");
            0.0
        });
        PartialAverage { len: self.partition.len() as u64, avg }
    }

    /// Run the worker until the coordinator closes its channels
    ///
    /// Chunks are drained before commands whenever both are ready, so data sent
    /// ahead of a command on an in-process link is always applied first.
    pub async fn run(mut self, mut links: WorkerLinks) -> Result<()> {
        info!(worker = %self.name, "Worker started");

        loop {
            tokio::select! {
                biased;

                chunk = links.chunks.recv() => match chunk {
                    Some(chunk) => self.extend(chunk),
                    None => break,
                },
                command = links.commands.recv() => match command {
                    Some(command) => {
                        debug!(worker = %self.name, command = ?command, "Handling command");
                        if let Some(reply) = self.handle(command) {
                            if links.replies.send(reply).is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        info!(worker = %self.name, "Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_worker(values: &[f64]) -> Worker {
        let mut worker = Worker::new("WORKER-test");
        worker.extend(values.to_vec());
        worker.handle(Command::Sort { request: 0 });
        worker
    }

    fn bracket(worker: &mut Worker, pivot: f64, direction: EstimationDirection) -> Bracket {
        match worker.handle(Command::ComputeBracket { request: 1, pivot, direction }) {
            Some(Reply::ComputeBracket { data, .. }) => data,
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    fn counts(worker: &mut Worker, pivot: f64) -> BoundCounts {
        match worker.handle(Command::ComputeBoundCounts { request: 1, pivot }) {
            Some(Reply::ComputeBoundCounts { data, .. }) => data,
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_sort_acknowledges() {
        let mut worker = Worker::new("WORKER-test");
        worker.extend(vec![3.0, 1.0, 2.0]);

        let reply = worker.handle(Command::Sort { request: 4 });
        assert_eq!(reply, Some(Reply::Sort { request: 4, data: SortAck { sorted: true } }));
        assert_eq!(worker.partition, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_local_median() {
        let mut worker = sorted_worker(&[7.0, 1.0, 4.0, 2.0]);
        let reply = worker.handle(Command::ComputeLocalMedian { request: 2 });
        assert_eq!(reply, Some(Reply::ComputeLocalMedian { request: 2, data: Some(3.0) }));
    }

    #[test]
    fn test_local_median_of_empty_partition() {
        let mut worker = Worker::new("WORKER-test");
        let reply = worker.handle(Command::ComputeLocalMedian { request: 2 });
        assert_eq!(reply, Some(Reply::ComputeLocalMedian { request: 2, data: None }));
    }

    #[test]
    fn test_bound_counts() {
        let mut worker = sorted_worker(&[1.0, 2.0, 3.0, 3.0, 4.0, 5.0]);

        let at = counts(&mut worker, 3.0);
        assert_eq!(at, BoundCounts { lower_count: 2, upper_count: 2, equal_count: 2 });

        let between = counts(&mut worker, 3.5);
        assert_eq!(between, BoundCounts { lower_count: 4, upper_count: 2, equal_count: 0 });

        let under = counts(&mut worker, 0.0);
        assert_eq!(under, BoundCounts { lower_count: 0, upper_count: 6, equal_count: 0 });

        let over = counts(&mut worker, 9.0);
        assert_eq!(over, BoundCounts { lower_count: 6, upper_count: 0, equal_count: 0 });
    }

    #[test]
    fn test_bound_counts_cover_partition() {
        let values = [5.0, 5.0, 1.0, 8.0, 3.0, 5.0, 2.0, 9.0];
        let mut worker = sorted_worker(&values);

        for pivot in [0.0, 1.0, 2.5, 5.0, 5.5, 9.0, 10.0] {
            let c = counts(&mut worker, pivot);
            let equal = values.iter().filter(|v| **v == pivot).count() as u64;
            assert_eq!(c.equal_count, equal);
            assert_eq!(c.total(), values.len() as u64);
        }
    }

    #[test]
    fn test_late_chunk_is_sorted_in() {
        let mut worker = sorted_worker(&[1.0, 5.0, 9.0]);
        worker.extend(vec![4.0, 0.0]);

        assert_eq!(counts(&mut worker, 4.5), BoundCounts { lower_count: 3, upper_count: 2, equal_count: 0 });
        assert_eq!(worker.partition, vec![0.0, 1.0, 4.0, 5.0, 9.0]);
    }

    #[test]
    fn test_bracket_directions() {
        let mut worker = sorted_worker(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);

        let upper = bracket(&mut worker, 3.0, EstimationDirection::TowardUpper);
        assert_eq!(upper, Bracket { first: Some(4.0), second: None });

        let lower = bracket(&mut worker, 3.0, EstimationDirection::TowardLower);
        assert_eq!(lower, Bracket { first: Some(3.0), second: None });

        let equal = bracket(&mut worker, 4.0, EstimationDirection::Equal);
        assert_eq!(equal, Bracket { first: Some(4.0), second: None });
    }

    #[test]
    fn test_bracket_equal_between_values() {
        let mut worker = sorted_worker(&[1.0, 2.0, 4.0, 5.0]);
        let pair = bracket(&mut worker, 3.0, EstimationDirection::Equal);
        assert_eq!(pair, Bracket { first: Some(2.0), second: Some(4.0) });
    }

    #[test]
    fn test_bracket_edges_of_partition() {
        let mut worker = sorted_worker(&[1.0, 2.0, 3.0, 4.0]);

        // Everything below the pivot: the largest value still brackets it
        let high = bracket(&mut worker, 4.5, EstimationDirection::Equal);
        assert_eq!(high, Bracket { first: Some(4.0), second: None });
        let high_lower = bracket(&mut worker, 4.5, EstimationDirection::TowardLower);
        assert_eq!(high_lower, Bracket { first: Some(4.0), second: None });
        let high_upper = bracket(&mut worker, 4.5, EstimationDirection::TowardUpper);
        assert_eq!(high_upper, Bracket { first: None, second: None });

        // Everything above the pivot
        let low = bracket(&mut worker, 0.5, EstimationDirection::Equal);
        assert_eq!(low, Bracket { first: None, second: Some(1.0) });
        let low_lower = bracket(&mut worker, 0.5, EstimationDirection::TowardLower);
        assert_eq!(low_lower, Bracket { first: None, second: None });
    }

    #[test]
    fn test_average() {
        let mut worker = sorted_worker(&[1.0, 1.0, 1.0, 1.0]);
        let reply = worker.handle(Command::ComputeAverage { request: 3 });
        assert_eq!(reply, Some(Reply::ComputeAverage { request: 3, data: PartialAverage { len: 4, avg: 1.0 } }));
    }

    #[test]
    fn test_average_of_empty_partition() {
        let mut worker = Worker::new("WORKER-test");
        let reply = worker.handle(Command::ComputeAverage { request: 3 });
        assert_eq!(reply, Some(Reply::ComputeAverage { request: 3, data: PartialAverage { len: 0, avg: 0.0 } }));
    }

    #[test]
    fn test_debug_commands() {
        let mut worker = sorted_worker(&[1.0, 2.0]);

        assert_eq!(worker.handle(Command::DumpLocalCache), None);
        assert_eq!(worker.partition.len(), 2);

        assert_eq!(worker.handle(Command::ResetLocalCache), None);
        assert!(worker.partition.is_empty());
    }

    #[tokio::test]
    async fn test_run_applies_chunks_before_commands() {
        use tokio::sync::mpsc;

        let (chunk_tx, chunks) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (replies, mut reply_rx) = mpsc::unbounded_channel();

        chunk_tx.send(vec![2.0, 6.0]).unwrap();
        chunk_tx.send(vec![4.0]).unwrap();
        command_tx.send(Command::ComputeAverage { request: 1 }).unwrap();

        let handle = tokio::spawn(Worker::new("WORKER-run").run(WorkerLinks { commands, chunks, replies }));

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply, Reply::ComputeAverage { request: 1, data: PartialAverage { len: 3, avg: 4.0 } });

        drop(command_tx);
        drop(chunk_tx);
        handle.await.unwrap().unwrap();
    }
}
