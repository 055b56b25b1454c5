//! One long-running consumer of a lane.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{CommandHandler, JobQueueAdapter};
use crate::pipeline::commands::Lane;

pub(super) struct Worker {
    pub id: String,
    pub lane: Lane,
    pub queue: JobQueueAdapter,
    pub handler: Arc<dyn CommandHandler>,
}

impl Worker {
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, lane = self.lane.as_str(), "queue worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self
                .queue
                .process_next(self.lane, self.handler.as_ref(), &self.id, &shutdown)
                .await
            {
                Ok(Some(delivery)) => {
                    debug!(worker_id = %self.id, ?delivery, "command delivered");
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work(self.lane) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "failed to process queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "queue worker stopped");
    }
}
