mod batch;
mod client;
pub mod config;
mod coordinator;
mod error;
mod master;
mod origin;
mod progress;
pub mod protocol;
mod resume_log;
pub mod run_log;
pub mod session;
mod status;
mod worker;

pub use batch::{BatchFile, image_mime_type, scan_folder};
pub use config::{
    CoordinatorConfig, CoordinatorSettings, RetryPolicy, WorkerConfig, load_coordinator_settings,
};
pub use coordinator::{CoordinatorHandle, spawn_coordinator};
pub use error::{Error, Result};
pub use master::{
    DEFAULT_THUMBNAIL_SIZE, FailedFile, MasterClient, UploadFolderConfig, UploadReport,
    UploadedFile, default_output_file, failure_log_for, resume_log_for, run_upload_folder,
    thumbnail_url,
};
pub use origin::{
    HttpEndpointConfig, HttpUploadEndpoint, InMemoryEndpoint, OriginUpload, ScriptedResponse,
    UploadEndpoint, parse_retry_after,
};
pub use progress::{MasterEvents, NoopEvents, WorkerEvents};
pub use protocol::{Message, Role, TaskHeader, UploadProgress, UploadResult};
pub use resume_log::{EntryStatus, ResumeLog, ResumeLogEntry, ResumeState, load_resume_log};
pub use status::{
    ConnectionStatus, ServerStats, WorkerStats, WorkerStatus, WorkerSummary, now_unix_ms,
};
pub use worker::{WorkerClient, WorkerExit, run_worker, upload_with_retry};
