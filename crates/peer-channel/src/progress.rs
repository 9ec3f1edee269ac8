use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_transferred: usize,
    pub total_bytes: usize,
    pub elapsed: Duration,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_transferred as f64 / self.total_bytes as f64
    }
}

/// Terminal state of a transfer as seen by whoever drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed,
    Refused,
    TimedOut,
}

/// Observer for an in-flight send. Called from the sending task.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TransferProgress);

    fn on_outcome(&self, _outcome: TransferOutcome) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _progress: TransferProgress) {}
}
