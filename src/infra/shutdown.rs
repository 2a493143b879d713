use std::time::Duration;
use tokio::sync::watch;

/// Broadcast side of the process-wide shutdown signal. One per binary;
/// triggered from the ctrl-c handler and observed by every task.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiving side, cheap to clone into every spawned loop.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is triggered.
    pub async fn wait(&mut self) {
        // borrow_and_update so a trigger that raced the subscribe is not missed
        if *self.rx.borrow_and_update() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Sender dropped: treat as shutdown so loops terminate.
    }

    /// Sleep for `dur`, returning early with `true` when shutdown fires.
    pub async fn sleep(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            _ = self.wait() => true,
        }
    }
}

/// Install a ctrl-c / SIGTERM listener that trips the handle.
pub fn listen_for_signals(handle: ShutdownHandle) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        handle.trigger();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_interrupted_by_trigger() {
        let (handle, mut shutdown) = channel();
        let task = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(30)).await });
        handle.trigger();
        let interrupted = task.await.unwrap();
        assert!(interrupted);
    }

    #[tokio::test]
    async fn sleep_times_out_without_trigger() {
        let (_handle, mut shutdown) = channel();
        let interrupted = shutdown.sleep(Duration::from_millis(10)).await;
        assert!(!interrupted);
    }
}
