use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{BatchFile, scan_folder};
use crate::client::{self, WsSink, WsSource};
use crate::config::{DEFAULT_SERVER_URL, RetryPolicy, validate_server_url};
use crate::progress::MasterEvents;
use crate::protocol::{Message, Role, TaskHeader, UploadResult};
use crate::resume_log::{ResumeLog, ResumeLogEntry, ResumeState, load_resume_log};
use crate::run_log::sanitize_filename_component;
use crate::status::ConnectionStatus;
use crate::{Error, Result};

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 100;

/// Master side of a coordinator connection.
pub struct MasterClient {
    server_url: String,
    sink: WsSink,
    source: WsSource,
    session_id: Uuid,
}

impl MasterClient {
    pub async fn connect(server_url: &str) -> Result<Self> {
        Self::register(server_url, None).await
    }

    /// Reclaims a session held for this master after a dropped connection.
    pub async fn resume(server_url: &str, session_id: Uuid) -> Result<Self> {
        Self::register(server_url, Some(session_id)).await
    }

    async fn register(server_url: &str, session_id: Option<Uuid>) -> Result<Self> {
        validate_server_url(server_url)?;
        let (sink, source, reg) =
            client::connect_and_register(server_url, Role::Master, session_id).await?;
        info!(
            event = "master.registered",
            master_id = %reg.assigned_id,
            session_id = %reg.session_id,
            workers = reg.server_stats.worker_count,
            "master.registered"
        );
        Ok(Self {
            server_url: server_url.to_string(),
            sink,
            source,
            session_id: reg.session_id,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: true,
            server_url: self.server_url.clone(),
            role: Role::Master,
            worker_id: None,
            session_id: Some(self.session_id),
        }
    }

    /// Declares the batch, then streams every payload as a `task` header
    /// followed by its binary frame, in declaration order.
    pub async fn submit_batch(&mut self, tasks: Vec<(TaskHeader, Vec<u8>)>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let headers = tasks.iter().map(|(h, _)| h.clone()).collect();
        client::send(&mut self.sink, &Message::SubmitTasks { tasks: headers }).await?;

        let count = tasks.len();
        for (header, payload) in tasks {
            if header.size != payload.len() as u64 {
                return Err(Error::protocol(format!(
                    "task {} declares {} bytes but has {}",
                    header.task_id,
                    header.size,
                    payload.len()
                )));
            }
            client::send(&mut self.sink, &Message::Task(header)).await?;
            self.sink.send(WsMessage::Binary(payload)).await?;
        }
        debug!(event = "master.batch_sent", count, "master.batch_sent");
        Ok(())
    }

    pub async fn request_stats(&mut self) -> Result<()> {
        client::send(&mut self.sink, &Message::GetStats).await
    }

    /// Next message from the coordinator; `None` once the connection is gone.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        client::recv(&mut self.source).await
    }

    pub async fn close(mut self) {
        let _ = self.sink.close().await;
    }
}

/// One entry of the output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub name: String,
    pub filename: String,
    pub url: String,
    pub display_url: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedFile {
    pub filename: String,
    pub path: PathBuf,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct UploadFolderConfig {
    pub folder: PathBuf,
    pub group_name: String,
    pub server_url: String,
    pub thumbnail_size: u32,
    pub output_file: PathBuf,
    pub failure_log: PathBuf,
    pub resume_log: PathBuf,
    pub resume: bool,
    pub retry: RetryPolicy,
}

impl UploadFolderConfig {
    pub fn new(folder: impl Into<PathBuf>, group_name: impl Into<String>) -> Self {
        let group_name = group_name.into();
        let output_file = default_output_file(&group_name);
        Self {
            folder: folder.into(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            failure_log: failure_log_for(&output_file),
            resume_log: resume_log_for(&output_file),
            output_file,
            group_name,
            resume: false,
            retry: RetryPolicy::default(),
        }
    }

    /// Points the output somewhere else and moves the side files with it.
    pub fn with_output_file(mut self, output_file: impl Into<PathBuf>) -> Self {
        self.output_file = output_file.into();
        self.failure_log = failure_log_for(&self.output_file);
        self.resume_log = resume_log_for(&self.output_file);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_server_url(&self.server_url)?;
        self.retry.validate()?;
        if self.group_name.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "group name must not be empty".to_string(),
            });
        }
        if self.thumbnail_size == 0 {
            return Err(Error::InvalidConfig {
                message: "thumbnail size must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

pub fn default_output_file(group_name: &str) -> PathBuf {
    PathBuf::from(format!(
        "uploads-{}.json",
        sanitize_filename_component(group_name)
    ))
}

pub fn failure_log_for(output_file: &Path) -> PathBuf {
    output_file.with_file_name(format!("{}-failed.log", output_stem(output_file)))
}

pub fn resume_log_for(output_file: &Path) -> PathBuf {
    output_file.with_file_name(format!("{}.resume.ndjson", output_stem(output_file)))
}

fn output_stem(output_file: &Path) -> String {
    output_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "uploads".to_string())
}

pub fn thumbnail_url(url: &str, size: u32) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}thumbnail={size}")
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub session_id: Option<Uuid>,
    pub total: usize,
    /// Already uploaded by an earlier run.
    pub skipped: usize,
    /// Uploaded by this run.
    pub uploaded: usize,
    pub failed: Vec<FailedFile>,
    /// Submitted but unresolved when the connection dropped.
    pub outstanding: Vec<String>,
    pub output_file: PathBuf,
    pub failure_log: Option<PathBuf>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.outstanding.is_empty()
    }
}

struct RunState<'a> {
    config: &'a UploadFolderConfig,
    files: Vec<BatchFile>,
    attempts: HashMap<String, u32>,
    uploaded: BTreeMap<String, String>,
    failed: BTreeMap<String, FailedFile>,
    in_flight: HashMap<Uuid, usize>,
    /// Tasks submitted before a reconnect whose fate is not known yet.
    unconfirmed: HashSet<Uuid>,
    scheduled: Vec<(Instant, usize)>,
    uploaded_this_run: usize,
    log: ResumeLog,
}

impl RunState<'_> {
    async fn submit(&mut self, client: &mut MasterClient, idxs: Vec<usize>) -> Result<()> {
        let mut batch = Vec::with_capacity(idxs.len());
        for idx in idxs {
            let file = &self.files[idx];
            let bytes = match file.read().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let filename = file.filename.clone();
                    self.record_failure(idx, &format!("read failed: {e}"))?;
                    warn!(
                        event = "master.read_failed",
                        filename = %filename,
                        error = %e,
                        "master.read_failed"
                    );
                    continue;
                }
            };
            let header = TaskHeader {
                task_id: Uuid::new_v4(),
                filename: file.filename.clone(),
                mime_type: file.mime_type.clone(),
                size: bytes.len() as u64,
            };
            self.in_flight.insert(header.task_id, idx);
            batch.push((header, bytes));
        }
        info!(event = "master.submit", count = batch.len(), "master.submit");
        client.submit_batch(batch).await
    }

    fn schedule_now(&mut self, idxs: impl IntoIterator<Item = usize>) {
        let now = Instant::now();
        self.scheduled.extend(idxs.into_iter().map(|idx| (now, idx)));
    }

    fn bump_attempts(&mut self, idx: usize) -> u32 {
        let n = self
            .attempts
            .entry(self.files[idx].filename.clone())
            .or_insert(0);
        *n += 1;
        *n
    }

    fn record_success(&mut self, idx: usize, url: String) -> Result<()> {
        let attempts = self.bump_attempts(idx);
        let filename = self.files[idx].filename.clone();
        self.log
            .append(&ResumeLogEntry::success(&filename, &url, attempts))?;
        info!(
            event = "master.file_uploaded",
            filename = %filename,
            url = %url,
            attempts,
            "master.file_uploaded"
        );
        self.uploaded.insert(filename, url);
        self.uploaded_this_run += 1;
        Ok(())
    }

    fn record_failure(&mut self, idx: usize, error: &str) -> Result<()> {
        let attempts = self.bump_attempts(idx);
        let file = &self.files[idx];
        self.log
            .append(&ResumeLogEntry::failed(&file.filename, error, attempts))?;

        let max_retries = self.config.retry.max_retries;
        if attempts < max_retries {
            let delay = self.config.retry.backoff_delay(attempts);
            info!(
                event = "master.resubmit_scheduled",
                filename = %file.filename,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error,
                "master.resubmit_scheduled"
            );
            self.scheduled.push((Instant::now() + delay, idx));
        } else {
            warn!(
                event = "master.file_failed",
                filename = %file.filename,
                attempts,
                error,
                "master.file_failed"
            );
            self.failed.insert(
                file.filename.clone(),
                FailedFile {
                    filename: file.filename.clone(),
                    path: file.path.clone(),
                    attempts,
                    error: error.to_string(),
                },
            );
        }
        Ok(())
    }

    /// Resolves one terminal result. Results for tasks this run no longer
    /// tracks are dropped.
    fn on_result(
        &mut self,
        task_id: &Uuid,
        result: UploadResult,
        events: &dyn MasterEvents,
    ) -> Result<()> {
        self.unconfirmed.remove(task_id);
        let Some(idx) = self.in_flight.remove(task_id) else {
            warn!(event = "master.unknown_task", task_id = %task_id, "master.unknown_task");
            return Ok(());
        };
        match result.url.filter(|_| result.success) {
            Some(url) => {
                self.record_success(idx, url.clone())?;
                events.on_remote_upload_complete(&self.files[idx].filename, &url);
            }
            None => {
                let error = result
                    .error
                    .unwrap_or_else(|| "upload reported no url".to_string());
                self.record_failure(idx, &error)?;
            }
        }
        Ok(())
    }

    /// The coordinator has gone idle, so unconfirmed tasks still unresolved
    /// never reached it or their results were lost. They go out again
    /// without being charged an attempt.
    fn resubmit_unconfirmed(&mut self) {
        let lost: Vec<Uuid> = self
            .unconfirmed
            .drain()
            .filter(|id| self.in_flight.contains_key(id))
            .collect();
        if lost.is_empty() {
            return;
        }
        let idxs: Vec<usize> = lost
            .iter()
            .filter_map(|id| self.in_flight.remove(id))
            .collect();
        info!(
            event = "master.resubmit_lost",
            count = idxs.len(),
            "master.resubmit_lost"
        );
        self.schedule_now(idxs);
    }

    /// Everything in flight belonged to a session that no longer exists.
    fn resubmit_all_in_flight(&mut self) {
        self.unconfirmed.clear();
        let idxs: Vec<usize> = self.in_flight.drain().map(|(_, idx)| idx).collect();
        if !idxs.is_empty() {
            info!(
                event = "master.resubmit_lost",
                count = idxs.len(),
                "master.resubmit_lost"
            );
        }
        self.schedule_now(idxs);
    }

    fn take_due(&mut self) -> Vec<usize> {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) =
            self.scheduled.drain(..).partition(|(at, _)| *at <= now);
        self.scheduled = later;
        due.into_iter().map(|(_, idx)| idx).collect()
    }

    fn outstanding(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .in_flight
            .values()
            .chain(self.scheduled.iter().map(|(_, idx)| idx))
            .map(|idx| self.files[*idx].filename.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn is_done(&self) -> bool {
        self.in_flight.is_empty() && self.scheduled.is_empty()
    }
}

/// Uploads every image under `config.folder` through the coordinator and
/// writes the output file, resume log and failure log.
pub async fn run_upload_folder(
    config: &UploadFolderConfig,
    events: &dyn MasterEvents,
) -> Result<UploadReport> {
    config.validate()?;
    let files = scan_folder(&config.folder)?;

    let resume = config.resume || config.output_file.exists() || config.resume_log.exists();
    let prior = if resume {
        load_resume_log(&config.resume_log)?
    } else {
        ResumeState::new()
    };

    let mut run = RunState {
        config,
        attempts: prior
            .values()
            .map(|e| (e.filename.clone(), e.attempts))
            .collect(),
        uploaded: prior
            .values()
            .filter(|e| e.is_success())
            .filter_map(|e| e.url.clone().map(|url| (e.filename.clone(), url)))
            .collect(),
        failed: BTreeMap::new(),
        in_flight: HashMap::new(),
        unconfirmed: HashSet::new(),
        scheduled: Vec::new(),
        uploaded_this_run: 0,
        log: ResumeLog::open(&config.resume_log)?,
        files,
    };

    let mut todo = Vec::new();
    let mut skipped = 0usize;
    for (idx, file) in run.files.iter().enumerate() {
        match prior.get(&file.filename) {
            Some(e) if e.is_success() && e.url.is_some() => skipped += 1,
            Some(e) if !e.is_success() && e.attempts >= config.retry.max_retries => {
                run.failed.insert(
                    file.filename.clone(),
                    FailedFile {
                        filename: file.filename.clone(),
                        path: file.path.clone(),
                        attempts: e.attempts,
                        error: e
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "upload failed".to_string()),
                    },
                );
            }
            _ => todo.push(idx),
        }
    }

    info!(
        event = "master.scan",
        folder = %config.folder.display(),
        total = run.files.len(),
        skipped,
        exhausted = run.failed.len(),
        todo = todo.len(),
        resume,
        "master.scan"
    );

    let mut session_id = None;
    let mut disconnected = false;
    if !todo.is_empty() {
        let mut client = connect_master(config).await?;
        session_id = Some(client.session_id());
        events.on_status(&client.status());
        run.schedule_now(todo);

        loop {
            match drive(&mut run, &mut client, events).await? {
                DriveEnd::Finished => break,
                DriveEnd::Rejected => {
                    disconnected = true;
                    break;
                }
                DriveEnd::ConnectionLost => {
                    events.on_status(&ConnectionStatus::disconnected(
                        config.server_url.clone(),
                        Role::Master,
                    ));
                    let Some(next) = reconnect(&mut run, client.session_id()).await else {
                        disconnected = true;
                        break;
                    };
                    client = next;
                    session_id = Some(client.session_id());
                    events.on_status(&client.status());
                }
            }
        }

        client.close().await;
        events.on_status(&ConnectionStatus::disconnected(
            config.server_url.clone(),
            Role::Master,
        ));
    }

    let outstanding = run.outstanding();
    if disconnected && !outstanding.is_empty() {
        warn!(
            event = "master.disconnected",
            outstanding = outstanding.len(),
            "master.disconnected"
        );
        events.on_disconnect(&outstanding);
    }

    write_output(config, &run.uploaded)?;
    let failed: Vec<FailedFile> = run.failed.into_values().collect();
    let failure_log = if failed.is_empty() && outstanding.is_empty() {
        None
    } else {
        write_failure_log(config, run.files.len(), run.uploaded.len(), &failed, &outstanding)?;
        Some(config.failure_log.clone())
    };

    let report = UploadReport {
        session_id,
        total: run.files.len(),
        skipped,
        uploaded: run.uploaded_this_run,
        failed,
        outstanding,
        output_file: config.output_file.clone(),
        failure_log,
    };
    info!(
        event = "master.finished",
        total = report.total,
        skipped = report.skipped,
        uploaded = report.uploaded,
        failed = report.failed.len(),
        outstanding = report.outstanding.len(),
        "master.finished"
    );
    Ok(report)
}

/// Registers as master, waiting out a coordinator that is still held by the
/// previous one. Connection errors are returned at once.
async fn connect_master(config: &UploadFolderConfig) -> Result<MasterClient> {
    let mut attempt = 0;
    loop {
        match MasterClient::connect(&config.server_url).await {
            Err(Error::Protocol { message }) if attempt < config.retry.max_retries => {
                attempt += 1;
                let delay = config.retry.backoff_delay(attempt);
                warn!(
                    event = "master.coordinator_busy",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %message,
                    "master.coordinator_busy"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

enum DriveEnd {
    Finished,
    ConnectionLost,
    /// The coordinator answered with `error` and closed the connection.
    Rejected,
}

/// Consumes coordinator messages and submits due files until every file is
/// resolved or the connection ends.
async fn drive(
    run: &mut RunState<'_>,
    client: &mut MasterClient,
    events: &dyn MasterEvents,
) -> Result<DriveEnd> {
    while !run.is_done() {
        let next_due = run.scheduled.iter().map(|(at, _)| *at).min();
        tokio::select! {
            message = client.next_message() => {
                let message = match message {
                    Ok(Some(message)) => message,
                    Ok(None) => return Ok(DriveEnd::ConnectionLost),
                    Err(e) => {
                        warn!(
                            event = "master.connection_error",
                            error = %e,
                            "master.connection_error"
                        );
                        return Ok(DriveEnd::ConnectionLost);
                    }
                };
                match message {
                    Message::Progress { task_id, result, progress } => {
                        events.on_progress(&progress);
                        run.on_result(&task_id, result, events)?;
                    }
                    Message::Waiting { progress } => {
                        info!(
                            event = "master.waiting",
                            waiting_for_ms = ?progress.waiting_for,
                            current_file = ?progress.current_file,
                            "master.waiting"
                        );
                        events.on_progress(&progress);
                    }
                    Message::SessionComplete { progress } => {
                        debug!(
                            event = "master.session_complete",
                            completed = progress.completed,
                            failed = progress.failed,
                            "master.session_complete"
                        );
                        events.on_progress(&progress);
                        run.resubmit_unconfirmed();
                    }
                    Message::Stats { server_stats } => {
                        if server_stats.pending_tasks == 0 && server_stats.active_tasks == 0 {
                            run.resubmit_unconfirmed();
                        }
                    }
                    Message::TasksSubmitted { count, total_pending } => {
                        debug!(
                            event = "master.tasks_submitted",
                            count,
                            total_pending,
                            "master.tasks_submitted"
                        );
                    }
                    Message::Error { message } => {
                        warn!(
                            event = "master.coordinator_error",
                            error = %message,
                            "master.coordinator_error"
                        );
                        return Ok(DriveEnd::Rejected);
                    }
                    other => {
                        debug!(
                            event = "master.message_ignored",
                            kind = other.kind(),
                            "master.message_ignored"
                        );
                    }
                }
            }
            _ = sleep_until_opt(next_due) => {
                let due = run.take_due();
                if !due.is_empty() {
                    match run.submit(client, due).await {
                        Ok(()) => {}
                        Err(e) if e.is_connection_loss() => {
                            warn!(
                                event = "master.connection_error",
                                error = %e,
                                "master.connection_error"
                            );
                            return Ok(DriveEnd::ConnectionLost);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
    Ok(DriveEnd::Finished)
}

/// Reclaims the held session with backoff. When the coordinator no longer
/// knows the session, registers afresh and resubmits everything in flight.
/// `None` once the retry budget is spent.
async fn reconnect(run: &mut RunState<'_>, session_id: Uuid) -> Option<MasterClient> {
    let config = run.config;
    for attempt in 1..=config.retry.max_retries {
        let delay = config.retry.backoff_delay(attempt);
        warn!(
            event = "master.reconnecting",
            attempt,
            delay_ms = delay.as_millis() as u64,
            session_id = %session_id,
            "master.reconnecting"
        );
        tokio::time::sleep(delay).await;

        match MasterClient::resume(&config.server_url, session_id).await {
            Ok(mut client) => {
                run.unconfirmed = run.in_flight.keys().copied().collect();
                if let Err(e) = client.request_stats().await {
                    warn!(
                        event = "master.reconnect_failed",
                        attempt,
                        error = %e,
                        "master.reconnect_failed"
                    );
                    continue;
                }
                return Some(client);
            }
            Err(Error::Protocol { message }) => {
                info!(
                    event = "master.resume_rejected",
                    session_id = %session_id,
                    reason = %message,
                    "master.resume_rejected"
                );
                match MasterClient::connect(&config.server_url).await {
                    Ok(client) => {
                        run.resubmit_all_in_flight();
                        return Some(client);
                    }
                    Err(e) => {
                        warn!(
                            event = "master.reconnect_failed",
                            attempt,
                            error = %e,
                            "master.reconnect_failed"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    event = "master.reconnect_failed",
                    attempt,
                    error = %e,
                    "master.reconnect_failed"
                );
            }
        }
    }
    None
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn write_output(config: &UploadFolderConfig, uploaded: &BTreeMap<String, String>) -> Result<()> {
    let entries: Vec<UploadedFile> = uploaded
        .iter()
        .map(|(filename, url)| UploadedFile {
            name: Path::new(filename)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| filename.clone()),
            filename: filename.clone(),
            url: url.clone(),
            display_url: thumbnail_url(url, config.thumbnail_size),
            group: config.group_name.clone(),
        })
        .collect();

    if let Some(parent) = config.output_file.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&entries)?;
    std::fs::write(&config.output_file, text)?;
    Ok(())
}

fn write_failure_log(
    config: &UploadFolderConfig,
    total: usize,
    succeeded: usize,
    failed: &[FailedFile],
    outstanding: &[String],
) -> Result<()> {
    let mut lines = vec![
        "# Upload Failure Log".to_string(),
        format!(
            "# Generated: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        format!("# Folder: {}", config.folder.display()),
        format!("# Group: {}", config.group_name),
        format!(
            "# Total: {total}, Succeeded: {succeeded}, Failed: {}, Outstanding: {}",
            failed.len(),
            outstanding.len()
        ),
        String::new(),
    ];
    for (i, f) in failed.iter().enumerate() {
        lines.push(format!("[{}/{}] {}", i + 1, failed.len(), f.filename));
        lines.push(format!("  Path: {}", f.path.display()));
        lines.push(format!("  Error: {}", f.error));
        lines.push(format!("  Attempts: {}", f.attempts));
    }
    for name in outstanding {
        lines.push(format!("[outstanding] {name}"));
        lines.push("  Error: not finished before the coordinator connection closed".to_string());
    }
    lines.push(String::new());

    if let Some(parent) = config.failure_log.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config.failure_log, lines.join("\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_url_appends_query() {
        assert_eq!(
            thumbnail_url("https://x/a.png", 100),
            "https://x/a.png?thumbnail=100"
        );
        assert_eq!(
            thumbnail_url("https://x/a.png?v=1", 64),
            "https://x/a.png?v=1&thumbnail=64"
        );
    }

    #[test]
    fn side_files_follow_output_stem() {
        let c = UploadFolderConfig::new("imgs", "cats & dogs");
        assert_eq!(c.output_file, PathBuf::from("uploads-cats___dogs.json"));
        assert_eq!(c.failure_log, PathBuf::from("uploads-cats___dogs-failed.log"));
        assert_eq!(
            c.resume_log,
            PathBuf::from("uploads-cats___dogs.resume.ndjson")
        );

        let c = c.with_output_file("out/run.json");
        assert_eq!(c.failure_log, PathBuf::from("out/run-failed.log"));
        assert_eq!(c.resume_log, PathBuf::from("out/run.resume.ndjson"));
    }

    #[test]
    fn config_validation() {
        let mut c = UploadFolderConfig::new("imgs", "g");
        assert!(c.validate().is_ok());
        c.server_url = "http://localhost".to_string();
        assert!(c.validate().is_err());

        let mut c = UploadFolderConfig::new("imgs", " ");
        assert!(c.validate().is_err());
        c.group_name = "g".to_string();
        c.thumbnail_size = 0;
        assert!(c.validate().is_err());
    }

    fn run_state<'a>(config: &'a UploadFolderConfig, names: &[&str]) -> RunState<'a> {
        RunState {
            config,
            files: names
                .iter()
                .map(|name| BatchFile {
                    path: config.folder.join(name),
                    filename: name.to_string(),
                    mime_type: "image/png".to_string(),
                    size: 1,
                })
                .collect(),
            attempts: HashMap::new(),
            uploaded: BTreeMap::new(),
            failed: BTreeMap::new(),
            in_flight: HashMap::new(),
            unconfirmed: HashSet::new(),
            scheduled: Vec::new(),
            uploaded_this_run: 0,
            log: ResumeLog::open(&config.resume_log).unwrap(),
        }
    }

    #[test]
    fn only_unresolved_unconfirmed_tasks_go_out_again() {
        let temp = tempfile::tempdir().unwrap();
        let config = UploadFolderConfig::new(temp.path(), "g")
            .with_output_file(temp.path().join("out.json"));
        let mut run = run_state(&config, &["a.png", "b.png", "c.png"]);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (idx, id) in ids.iter().enumerate() {
            run.in_flight.insert(*id, idx);
        }
        run.unconfirmed = [ids[0], ids[1]].into_iter().collect();

        let done = UploadResult::succeeded("a.png", "mem://a");
        run.on_result(&ids[0], done, &crate::progress::NoopEvents)
            .unwrap();
        run.resubmit_unconfirmed();

        assert!(run.unconfirmed.is_empty());
        assert_eq!(run.in_flight.keys().collect::<Vec<_>>(), vec![&ids[2]]);
        assert_eq!(run.take_due(), vec![1]);
        assert!(!run.attempts.contains_key("b.png"), "lost submission is not an attempt");
        assert_eq!(run.uploaded.get("a.png").map(String::as_str), Some("mem://a"));
    }

    #[test]
    fn failure_log_lists_failed_and_outstanding_files() {
        let temp = tempfile::tempdir().unwrap();
        let config = UploadFolderConfig::new(temp.path(), "g")
            .with_output_file(temp.path().join("out.json"));
        let failed = vec![FailedFile {
            filename: "b.png".to_string(),
            path: temp.path().join("b.png"),
            attempts: 8,
            error: "http 500".to_string(),
        }];
        write_failure_log(&config, 3, 1, &failed, &["c.png".to_string()]).unwrap();

        let text = std::fs::read_to_string(&config.failure_log).unwrap();
        assert!(text.starts_with("# Upload Failure Log"));
        assert!(text.contains("# Total: 3, Succeeded: 1, Failed: 1, Outstanding: 1"));
        assert!(text.contains("[1/1] b.png"));
        assert!(text.contains("  Attempts: 8"));
        assert!(text.contains("[outstanding] c.png"));
    }
}
