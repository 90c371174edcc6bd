use crate::protocol::{TaskHeader, UploadProgress};
use crate::status::{ConnectionStatus, WorkerStats};

/// Callbacks a master-side UI receives while a batch runs.
pub trait MasterEvents: Send + Sync {
    fn on_status(&self, _status: &ConnectionStatus) {}

    fn on_progress(&self, _progress: &UploadProgress) {}

    fn on_remote_upload_complete(&self, _filename: &str, _url: &str) {}

    /// Called once when the connection drops with files still outstanding.
    fn on_disconnect(&self, _pending_filenames: &[String]) {}
}

/// Callbacks a worker-side UI receives to show liveness.
pub trait WorkerEvents: Send + Sync {
    fn on_status(&self, _status: &ConnectionStatus) {}

    fn on_current_task(&self, _task: Option<&TaskHeader>) {}

    fn on_stats(&self, _stats: &WorkerStats) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl MasterEvents for NoopEvents {}

impl WorkerEvents for NoopEvents {}
