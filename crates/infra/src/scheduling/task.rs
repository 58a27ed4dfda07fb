//! Start/stop lifecycle shared by the background services

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::scheduler::{SchedulerError, SchedulerResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

type TaskHandle = Arc<Mutex<Option<JoinHandle<()>>>>;

/// One spawned loop plus the token that stops it
pub(crate) struct BackgroundTask {
    name: &'static str,
    cancellation_token: CancellationToken,
    task_handle: TaskHandle,
}

impl BackgroundTask {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            cancellation_token: CancellationToken::new(),
            task_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn `run` with a fresh cancellation token
    pub(crate) async fn start<F, Fut>(&mut self, run: F) -> SchedulerResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        // New token so a stopped task can be restarted
        self.cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(run(self.cancellation_token.clone()));
        *self.task_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Cancel the loop and wait up to `join_timeout` for it to return
    pub(crate) async fn stop(&mut self, join_timeout: Duration) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        self.cancellation_token.cancel();
        if let Some(handle) = self.task_handle.lock().await.take() {
            tokio::time::timeout(join_timeout, handle)
                .await
                .map_err(|_| SchedulerError::Timeout(join_timeout))?
                .map_err(|err| SchedulerError::TaskJoinFailed(err.to_string()))?;
        }
        Ok(())
    }

    /// Whether the spawned loop exists and has not returned
    pub(crate) fn is_running(&self) -> bool {
        self.task_handle
            .try_lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() && self.is_running() {
            warn!(task = self.name, "background task dropped while running; cancelling");
        }
        self.cancellation_token.cancel();
    }
}
