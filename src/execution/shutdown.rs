use std::time::Duration;

use tokio::sync::watch;

/// Process-wide cooperative stop signal
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // Sender lives in self, so wait_for only errs if the signal is gone
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration`; returns false if interrupted by shutdown
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = self.wait() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
