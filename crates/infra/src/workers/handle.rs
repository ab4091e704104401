use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cooperative shutdown signal observed by background loops.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal paired with its trigger.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested (or the trigger is dropped).
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless shutdown comes first. Returns `true` on shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_shutdown(),
            _ = self.wait() => true,
        }
    }
}

/// Handle to control and join a background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `task` with a fresh shutdown signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, signal) = ShutdownSignal::channel();
        let join = tokio::spawn(task(signal));
        info!(task = %name, "background task started");
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// Request graceful shutdown and wait up to `grace` for the task to
    /// finish its in-flight work; abort it after that.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let Some(mut join) = self.join.take() else {
            return;
        };

        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(())) => info!(task = %self.name, "background task stopped"),
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "background task ended abnormally"),
            Err(_) => {
                warn!(task = %self.name, ?grace, "background task exceeded shutdown grace; aborting");
                join.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn cooperative_task_stops_within_grace() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let handle = TaskHandle::spawn("test-loop", move |mut signal| async move {
            while !signal.sleep(Duration::from_millis(5)).await {}
            flag.store(true, Ordering::SeqCst);
        });

        handle.shutdown(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stuck_task_is_aborted_after_grace() {
        let handle = TaskHandle::spawn("stuck", |_signal| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = std::time::Instant::now();
        handle.shutdown(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
