use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative pause switch shared between a caller and a sending loop.
///
/// The sender checks it between chunks only, so a write already handed to
/// the socket always completes.
#[derive(Debug, Clone)]
pub struct PauseSignal {
    running: Arc<watch::Sender<bool>>,
}

impl Default for PauseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseSignal {
    pub fn new() -> Self {
        let (running, _) = watch::channel(true);
        Self {
            running: Arc::new(running),
        }
    }

    pub fn pause(&self) {
        self.running.send_replace(false);
    }

    pub fn resume(&self) {
        self.running.send_replace(true);
    }

    pub fn is_paused(&self) -> bool {
        !*self.running.borrow()
    }

    /// Return immediately when running, otherwise park until `resume`.
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting
        let _ = rx.wait_for(|running| *running).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_running_by_default() {
        let signal = PauseSignal::new();
        assert!(!signal.is_paused());
        tokio::time::timeout(Duration::from_millis(100), signal.wait_until_resumed())
            .await
            .expect("should not block when running");
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let signal = PauseSignal::new();
        signal.pause();
        assert!(signal.is_paused());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait_until_resumed().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        signal.resume();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake on resume")
            .unwrap();
    }
}
