//! Handle for a single cancellable background loop.

use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns one spawned loop and the watch channel used to stop it.
///
/// The loop receives a `watch::Receiver<bool>` that flips to `true` when
/// [`BackgroundTask::stop`] is called. Stopping is idempotent and safe before
/// the loop was ever spawned; a stopped task cannot be restarted.
pub struct BackgroundTask {
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for BackgroundTask {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTask {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the loop. Does nothing if already running or stopped.
    pub fn spawn<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() || *self.stop_tx.borrow() {
            return false;
        }
        *handle = Some(tokio::spawn(f(self.stop_tx.subscribe())));
        true
    }

    /// Signal the loop and wait for it to finish.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Resolves once `stop` reads `true` or its sender is gone.
pub async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
