use std::io::Write;
use std::path::Path;

use collab_upload_core::run_log::{RunLogGuard, RunLogKind, resolve_log_dir, start_run_log};
use collab_upload_core::{
    ConnectionStatus, MasterEvents, TaskHeader, UploadProgress, WorkerEvents, WorkerStats,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: &'static str,
    pub message: String,
    pub details: serde_json::Value,
    pub retryable: bool,
}

impl CliError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    pub fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

pub fn map_core_err(e: collab_upload_core::Error) -> CliError {
    use collab_upload_core::Error;
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Protocol { message } => CliError::new("protocol.error", message),
        Error::WebSocket(e) => CliError::retryable("coordinator.unavailable", e.to_string()),
        Error::Disconnected => CliError::retryable("coordinator.disconnected", "disconnected"),
        Error::RateLimited { retry_after_ms } => CliError::retryable(
            "origin.rate_limited",
            format!("rate limited (retry after {retry_after_ms:?} ms)"),
        ),
        Error::TransientUpload { message } => CliError::retryable("upload.failed", message),
        Error::PermanentUpload { attempts, message } => CliError::new(
            "upload.failed",
            format!("failed after {attempts} attempts: {message}"),
        ),
        Error::NonUtf8Path { path } => {
            CliError::new("path.non_utf8", format!("{}", path.display()))
        }
        other => CliError::new("unknown", other.to_string()),
    }
}

pub fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        r#"{"code":"unknown","message":"json encode failed","details":{},"retryable":false}"#
            .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}

/// Installs logging and, when a directory is configured, opens the NDJSON
/// run log for this process.
pub fn init_run_log(
    kind: RunLogKind,
    run_id: &str,
    cli_dir: Option<&Path>,
) -> Result<Option<RunLogGuard>, CliError> {
    collab_upload_core::run_log::init_logging();
    let Some(dir) = resolve_log_dir(cli_dir) else {
        return Ok(None);
    };
    start_run_log(kind, run_id, &dir)
        .map(Some)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))
}

/// Prints progress as NDJSON on stdout when `events` is set, short human
/// lines on stderr otherwise.
pub struct CliEvents {
    pub events: bool,
}

impl CliEvents {
    fn emit(&self, line: serde_json::Value) {
        println!("{line}");
    }
}

impl MasterEvents for CliEvents {
    fn on_status(&self, status: &ConnectionStatus) {
        if self.events {
            self.emit(serde_json::json!({ "type": "connection.status", "status": status }));
        } else if status.connected {
            eprintln!("connected to {}", status.server_url);
        }
    }

    fn on_progress(&self, progress: &UploadProgress) {
        if self.events {
            self.emit(serde_json::json!({ "type": "upload.progress", "progress": progress }));
        } else if let Some(ms) = progress.waiting_for {
            eprintln!(
                "rate limited, pausing {:.1}s ({}/{} done)",
                ms as f64 / 1000.0,
                progress.finished(),
                progress.total
            );
        }
    }

    fn on_remote_upload_complete(&self, filename: &str, url: &str) {
        if self.events {
            self.emit(serde_json::json!({
                "type": "upload.completed",
                "filename": filename,
                "url": url,
            }));
        } else {
            eprintln!("uploaded {filename} -> {url}");
        }
    }

    fn on_disconnect(&self, pending_filenames: &[String]) {
        if self.events {
            self.emit(serde_json::json!({
                "type": "connection.lost",
                "pending": pending_filenames,
            }));
        } else {
            eprintln!(
                "coordinator connection lost with {} files outstanding",
                pending_filenames.len()
            );
        }
    }
}

impl WorkerEvents for CliEvents {
    fn on_status(&self, status: &ConnectionStatus) {
        if self.events {
            self.emit(serde_json::json!({ "type": "connection.status", "status": status }));
        } else if status.connected {
            eprintln!(
                "registered with {} as {}",
                status.server_url,
                status
                    .worker_id
                    .map(|id| id.to_string())
                    .unwrap_or_default()
            );
        } else {
            eprintln!("not connected to {}", status.server_url);
        }
    }

    fn on_current_task(&self, task: Option<&TaskHeader>) {
        if self.events {
            self.emit(serde_json::json!({ "type": "worker.task", "task": task }));
        } else if let Some(task) = task {
            eprintln!("uploading {} ({} bytes)", task.filename, task.size);
        }
    }

    fn on_stats(&self, stats: &WorkerStats) {
        if self.events {
            self.emit(serde_json::json!({ "type": "worker.stats", "stats": stats }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_stable_codes() {
        let e = map_core_err(collab_upload_core::Error::InvalidConfig {
            message: "bad".to_string(),
        });
        assert_eq!(e.code, "config.invalid");
        assert!(!e.retryable);

        let e = map_core_err(collab_upload_core::Error::Disconnected);
        assert_eq!(e.code, "coordinator.disconnected");
        assert!(e.retryable);
    }

    #[test]
    fn cli_error_serializes_as_one_json_object() {
        let e = CliError::new("upload.incomplete", "2 files failed")
            .with_details(serde_json::json!({ "failed": 2 }));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["code"], "upload.incomplete");
        assert_eq!(v["details"]["failed"], 2);
        assert_eq!(v["retryable"], false);
    }
}
