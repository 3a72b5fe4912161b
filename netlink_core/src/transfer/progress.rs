use crate::TransferEvent;
use std::time::Instant;
use tokio::sync::mpsc;

/// One progress sample, produced per chunk and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub file_name: String,
    /// Bytes of the current file on the receiver so far, resume offset included
    pub sent: u64,
    pub file_size: u64,
    /// Running total across every file of the connection
    pub total_sent: u64,
    pub total_size: u64,
    /// Bytes per second over this connection
    pub speed: f64,
    /// Seconds left for the current file, `None` while speed is zero
    pub file_eta: Option<f64>,
    pub total_eta: Option<f64>,
    pub is_sending: bool,
}

impl TransferProgress {
    pub fn percent(&self) -> f32 {
        if self.file_size == 0 {
            return 100.0;
        }
        (self.sent as f32 / self.file_size as f32) * 100.0
    }
}

/// Receives progress samples. Implemented for closures and event channels.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &TransferProgress);
}

impl<F> ProgressReporter for F
where
    F: Fn(&TransferProgress) + Send + Sync,
{
    fn report(&self, progress: &TransferProgress) {
        self(progress)
    }
}

impl ProgressReporter for mpsc::Sender<TransferEvent> {
    fn report(&self, progress: &TransferProgress) {
        // Lossy on purpose: a slow consumer must not stall the socket
        let _ = self.try_send(TransferEvent::Progress(progress.clone()));
    }
}

/// Reporter that drops every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _progress: &TransferProgress) {}
}

/// Computes speed and ETA for one connection.
#[derive(Debug)]
pub struct ProgressMeter {
    started: Instant,
    /// Bytes already present before this connection (resume offset)
    baseline: u64,
    total_size: u64,
    is_sending: bool,
}

impl ProgressMeter {
    pub fn new(total_size: u64, baseline: u64, is_sending: bool) -> Self {
        Self {
            started: Instant::now(),
            baseline,
            total_size,
            is_sending,
        }
    }

    /// Receivers of a batch only learn sizes file by file.
    pub fn grow_total(&mut self, size: u64) {
        self.total_size += size;
    }

    pub fn sample(
        &self,
        file_name: &str,
        sent: u64,
        file_size: u64,
        total_sent: u64,
    ) -> TransferProgress {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let speed = total_sent.saturating_sub(self.baseline) as f64 / elapsed;
        let eta = |remaining: u64| (speed > 0.0).then(|| remaining as f64 / speed);

        TransferProgress {
            file_name: file_name.to_string(),
            sent,
            file_size,
            total_sent,
            total_size: self.total_size,
            speed,
            file_eta: eta(file_size.saturating_sub(sent)),
            total_eta: eta(self.total_size.saturating_sub(total_sent)),
            is_sending: self.is_sending,
        }
    }
}
