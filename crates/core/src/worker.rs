use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{self, Frame, WsSink, WsSource};
use crate::config::{RetryPolicy, WorkerConfig};
use crate::origin::{OriginUpload, UploadEndpoint};
use crate::progress::WorkerEvents;
use crate::protocol::{Message, PayloadAssembler, Role, TaskHeader, UploadResult};
use crate::status::{ConnectionStatus, WorkerStats};
use crate::{Error, Result};

/// Why [`WorkerClient::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    /// The coordinator sent `disconnectNotice`.
    Dismissed { reason: String },
    ConnectionClosed,
}

/// Uploads one task, retrying transient failures with exponential backoff.
///
/// A 429 is returned immediately as [`Error::RateLimited`]; the pause is
/// coordinated session-wide and does not consume the local budget. When the
/// budget is spent the last error is wrapped in [`Error::PermanentUpload`].
pub async fn upload_with_retry(
    endpoint: &dyn UploadEndpoint,
    header: &TaskHeader,
    payload: Vec<u8>,
    policy: &RetryPolicy,
) -> Result<OriginUpload> {
    let mut retry = 0u32;
    loop {
        match endpoint
            .upload(&header.filename, &header.mime_type, payload.clone())
            .await
        {
            Ok(upload) => return Ok(upload),
            Err(e @ Error::RateLimited { .. }) => return Err(e),
            Err(e) => {
                if retry >= policy.max_retries {
                    return Err(Error::PermanentUpload {
                        attempts: retry + 1,
                        message: e.to_string(),
                    });
                }
                retry += 1;
                let delay = policy.backoff_delay(retry);
                warn!(
                    event = "worker.upload_retry",
                    provider = endpoint.provider(),
                    task_id = %header.task_id,
                    filename = %header.filename,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "worker.upload_retry"
                );
                sleep(delay).await;
            }
        }
    }
}

pub struct WorkerClient {
    config: WorkerConfig,
    sink: WsSink,
    source: WsSource,
    status: ConnectionStatus,
    stats: WorkerStats,
}

impl WorkerClient {
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let (sink, source, reg) =
            client::connect_and_register(&config.server_url, Role::Worker, None).await?;
        info!(
            event = "worker.registered",
            worker_id = %reg.assigned_id,
            session_id = %reg.session_id,
            workers = reg.server_stats.worker_count,
            "worker.registered"
        );
        let status = ConnectionStatus {
            connected: true,
            server_url: config.server_url.clone(),
            role: Role::Worker,
            worker_id: Some(reg.assigned_id),
            session_id: Some(reg.session_id),
        };
        Ok(Self {
            config,
            sink,
            source,
            status,
            stats: WorkerStats::default(),
        })
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn worker_id(&self) -> Option<Uuid> {
        self.status.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Serves assignments until cancelled or disconnected. Uploads run in a
    /// spawned task so heartbeats keep flowing while a file is in flight.
    pub async fn run(
        mut self,
        endpoint: Arc<dyn UploadEndpoint>,
        events: &dyn WorkerEvents,
        cancel: &CancellationToken,
    ) -> Result<WorkerExit> {
        events.on_status(&self.status);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let (done_tx, mut done_rx) = mpsc::channel::<(TaskHeader, Result<OriginUpload>)>(1);
        let mut assembler = PayloadAssembler::new();
        let mut in_flight: Option<JoinHandle<()>> = None;

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(WorkerExit::Cancelled),
                _ = heartbeat.tick() => {
                    if let Err(e) = client::send(&mut self.sink, &Message::Heartbeat).await {
                        break Err(e);
                    }
                }
                Some((header, outcome)) = done_rx.recv() => {
                    in_flight = None;
                    if let Err(e) = self.report(header, outcome, events).await {
                        break Err(e);
                    }
                }
                frame = client::recv_frame(&mut self.source) => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break Ok(WorkerExit::ConnectionClosed),
                        Err(e) => break Err(e),
                    };
                    match self.on_frame(frame, &mut assembler, in_flight.is_some()) {
                        Ok(FrameAction::Continue) => {}
                        Ok(FrameAction::Start(header, payload)) => {
                            events.on_current_task(Some(&header));
                            let endpoint = Arc::clone(&endpoint);
                            let policy = self.config.retry;
                            let done = done_tx.clone();
                            in_flight = Some(tokio::spawn(async move {
                                let outcome = upload_with_retry(
                                    endpoint.as_ref(),
                                    &header,
                                    payload,
                                    &policy,
                                )
                                .await;
                                let _ = done.send((header, outcome)).await;
                            }));
                        }
                        Ok(FrameAction::Exit(exit)) => break Ok(exit),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        if let Some(task) = in_flight.take() {
            task.abort();
            events.on_current_task(None);
        }
        if matches!(exit, Ok(WorkerExit::Cancelled)) {
            let _ = futures_util::SinkExt::close(&mut self.sink).await;
        }
        info!(
            event = "worker.stopped",
            worker_id = ?self.status.worker_id,
            completed = self.stats.completed,
            failed = self.stats.failed,
            exit = ?exit,
            "worker.stopped"
        );
        self.status.connected = false;
        events.on_status(&self.status);
        exit
    }

    fn on_frame(
        &mut self,
        frame: Frame,
        assembler: &mut PayloadAssembler,
        busy: bool,
    ) -> Result<FrameAction> {
        match frame {
            Frame::Binary(bytes) => {
                let (header, payload) = assembler.accept_binary(bytes)?;
                info!(
                    event = "worker.task_received",
                    task_id = %header.task_id,
                    filename = %header.filename,
                    size = header.size,
                    "worker.task_received"
                );
                Ok(FrameAction::Start(header, payload))
            }
            Frame::Text(message) => {
                assembler.check_text_allowed(message.kind())?;
                match message {
                    Message::Assign(header) => {
                        if busy {
                            return Err(Error::protocol(format!(
                                "task {} assigned while an upload is in flight",
                                header.task_id
                            )));
                        }
                        assembler.expect_payload(header)?;
                        Ok(FrameAction::Continue)
                    }
                    Message::DisconnectNotice { reason } => {
                        warn!(
                            event = "worker.dismissed",
                            reason = %reason,
                            "worker.dismissed"
                        );
                        Ok(FrameAction::Exit(WorkerExit::Dismissed { reason }))
                    }
                    Message::Error { message } => Err(Error::Protocol { message }),
                    other => {
                        debug!(
                            event = "worker.message_ignored",
                            kind = other.kind(),
                            "worker.message_ignored"
                        );
                        Ok(FrameAction::Continue)
                    }
                }
            }
        }
    }

    async fn report(
        &mut self,
        header: TaskHeader,
        outcome: Result<OriginUpload>,
        events: &dyn WorkerEvents,
    ) -> Result<()> {
        let message = match outcome {
            Ok(upload) => {
                self.stats.completed += 1;
                self.stats.total_bytes += header.size;
                info!(
                    event = "worker.upload_succeeded",
                    task_id = %header.task_id,
                    filename = %header.filename,
                    url = %upload.url,
                    "worker.upload_succeeded"
                );
                Message::TaskResult {
                    task_id: header.task_id,
                    result: UploadResult::succeeded(header.filename, upload.url),
                    stats: self.stats,
                }
            }
            Err(Error::RateLimited { retry_after_ms }) => {
                let retry_after_ms = retry_after_ms
                    .unwrap_or(self.config.default_retry_after.as_millis() as u64);
                warn!(
                    event = "worker.rate_limited",
                    task_id = %header.task_id,
                    filename = %header.filename,
                    retry_after_ms,
                    "worker.rate_limited"
                );
                Message::RateLimitHit {
                    task_id: header.task_id,
                    retry_after_ms,
                }
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(
                    event = "worker.upload_failed",
                    task_id = %header.task_id,
                    filename = %header.filename,
                    error = %e,
                    "worker.upload_failed"
                );
                Message::TaskResult {
                    task_id: header.task_id,
                    result: UploadResult::failed(header.filename, e.to_string()),
                    stats: self.stats,
                }
            }
        };

        events.on_current_task(None);
        events.on_stats(&self.stats);
        client::send(&mut self.sink, &message).await
    }
}

enum FrameAction {
    Continue,
    Start(TaskHeader, Vec<u8>),
    Exit(WorkerExit),
}

/// Keeps a worker connected until `cancel` fires, reconnecting after
/// `reconnect_delay` whenever the coordinator drops it.
pub async fn run_worker(
    config: WorkerConfig,
    endpoint: Arc<dyn UploadEndpoint>,
    events: &dyn WorkerEvents,
    cancel: CancellationToken,
) -> Result<()> {
    config.validate()?;
    loop {
        match WorkerClient::connect(config.clone()).await {
            Ok(client) => match client.run(Arc::clone(&endpoint), events, &cancel).await {
                Ok(WorkerExit::Cancelled) => return Ok(()),
                Ok(exit) => {
                    info!(event = "worker.session_ended", exit = ?exit, "worker.session_ended");
                }
                Err(e) => {
                    warn!(event = "worker.session_failed", error = %e, "worker.session_failed");
                }
            },
            Err(e) => {
                warn!(
                    event = "worker.connect_failed",
                    server_url = %config.server_url,
                    error = %e,
                    "worker.connect_failed"
                );
                events.on_status(&ConnectionStatus::disconnected(
                    config.server_url.clone(),
                    Role::Worker,
                ));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep(config.reconnect_delay) => {}
        }
    }
}
