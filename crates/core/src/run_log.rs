use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Open run log file. `None` turns the JSON layer into a sink.
static RUN_LOG_FILE: Mutex<Option<BufWriter<File>>> = Mutex::new(None);
static TRACING_INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLogKind {
    Coordinator,
    Worker,
    Master,
}

impl RunLogKind {
    fn file_prefix(self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
            Self::Master => "master",
        }
    }
}

fn run_log_file() -> MutexGuard<'static, Option<BufWriter<File>>> {
    RUN_LOG_FILE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Writer handed to the JSON layer per event.
struct RunLogWriter;

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match run_log_file().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        run_log_file().as_mut().map_or(Ok(()), |file| file.flush())
    }
}

/// First directive set that parses wins; `info` otherwise.
fn env_filter<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> EnvFilter {
    candidates
        .into_iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Installs the global subscriber: compact lines on stderr plus the NDJSON
/// run log, which stays a sink until [`start_run_log`] opens a file.
pub fn init_logging() {
    TRACING_INIT.call_once(|| {
        let collab = std::env::var("COLLAB_UPLOAD_LOG").ok();
        let rust_log = std::env::var("RUST_LOG").ok();

        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(|| RunLogWriter);
        let stderr_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr);

        let _ = tracing_subscriber::registry()
            .with(env_filter([collab.as_deref(), rust_log.as_deref()]))
            .with(json_layer)
            .with(stderr_layer)
            .try_init();
    });
}

/// Flushes and syncs the run log file when dropped.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(mut file) = run_log_file().take() {
            let _ = file.flush();
            let _ = file.get_ref().sync_all();
        }
    }
}

/// Opens `collab-<kind>-<utc>-<run_id>.ndjson` under `log_dir`. Only one run
/// log may be open per process.
pub fn start_run_log(
    kind: RunLogKind,
    run_id: &str,
    log_dir: &Path,
) -> std::io::Result<RunLogGuard> {
    init_logging();
    std::fs::create_dir_all(log_dir)?;

    let path = log_dir.join(format!(
        "collab-{}-{}-{}.ndjson",
        kind.file_prefix(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    ));

    let mut slot = run_log_file();
    if slot.is_some() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "run log already open",
        ));
    }
    let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
    *slot = Some(BufWriter::new(file));

    Ok(RunLogGuard { path })
}

/// `--run-log-dir`, else `COLLAB_UPLOAD_LOG_DIR`, else no run log file.
pub fn resolve_log_dir(cli_dir: Option<&Path>) -> Option<PathBuf> {
    cli_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("COLLAB_UPLOAD_LOG_DIR").map(PathBuf::from))
}

/// Keeps `[A-Za-z0-9._-]` and maps everything else to `_`.
pub fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
