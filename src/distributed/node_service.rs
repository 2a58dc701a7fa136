//! Node service for the worker role
//!
//! The node service is what `statpool --role worker` runs on each node:
//! - Assigns the worker an identifier used in logs and hello frames
//! - Connects the three channels to the coordinator (retrying until it is up)
//! - Runs the worker loop until the coordinator goes away

use crate::config::Config;
use crate::distributed::transport::connect_worker;
use crate::distributed::worker::Worker;
use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

/// Fresh worker identifier (`WORKER-<uuid>`)
pub fn new_worker_name() -> String {
    format!("WORKER-{}", Uuid::new_v4())
}

/// Node service
///
/// Owns one worker and its connections to the coordinator.
pub struct NodeService {
    config: Config,

    /// Worker identifier
    worker_name: String,
}

impl NodeService {
    /// Create a new node service with a freshly generated worker name
    pub fn new(config: Config) -> Self {
        Self {
            config,
            worker_name: new_worker_name(),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Run the node service
    ///
    /// Returns once the coordinator closes its channels.
    pub async fn run(self) -> Result<()> {
        info!(
            worker = %self.worker_name,
            broadcast = %self.config.channels.broadcast,
            work = %self.config.channels.work,
            results = %self.config.channels.results,
            "Connecting to coordinator"
        );

        let (links, io_tasks) = connect_worker(
            &self.config.channels,
            &self.worker_name,
            self.config.protocol.connect_timeout(),
        )
        .await
        .with_context(|| format!("{} failed to reach the coordinator", self.worker_name))?;

        let result = Worker::new(self.worker_name).run(links).await;

        for task in io_tasks {
            task.abort();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_worker_names_are_unique() {
        let names: HashSet<String> = (0..100).map(|_| new_worker_name()).collect();
        assert_eq!(names.len(), 100);
        assert!(names.iter().all(|n| n.starts_with("WORKER-")));
        assert!(names.iter().all(|n| Uuid::parse_str(&n["WORKER-".len()..]).is_ok()));
    }

    #[tokio::test]
    async fn test_run_fails_without_coordinator() {
        // Bind and drop a listener to find a port nobody is listening on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut config = Config::default();
        config.channels.broadcast = format!("127.0.0.1:{}", port);
        config.protocol.connect_timeout_ms = 200;

        let service = NodeService::new(config);
        let name = service.worker_name().to_string();

        let err = service.run().await.unwrap_err();
        assert!(format!("{:#}", err).contains(&name));
    }
}
