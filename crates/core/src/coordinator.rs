use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, sleep};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::protocol::{Message, PayloadAssembler, Role, TaskHeader};
use crate::session::{Effect, Session, WorkerId};
use crate::status::{ServerStats, now_unix_ms};
use crate::{Error, Result};

type ConnId = u64;

enum Event {
    Connected {
        conn_id: ConnId,
        outbound: mpsc::UnboundedSender<WsMessage>,
    },
    Text {
        conn_id: ConnId,
        message: Message,
    },
    Payload {
        conn_id: ConnId,
        header: TaskHeader,
        bytes: Vec<u8>,
    },
    Violation {
        conn_id: ConnId,
        message: String,
    },
    Closed {
        conn_id: ConnId,
    },
    Snapshot {
        reply: oneshot::Sender<(Uuid, ServerStats)>,
    },
}

pub struct CoordinatorHandle {
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` url clients on this host can connect to.
    pub fn url(&self) -> String {
        let ip = if self.local_addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            self.local_addr.ip().to_string()
        };
        format!("ws://{}:{}", ip, self.local_addr.port())
    }

    /// Current session id and stats, straight from the actor.
    pub async fn snapshot(&self) -> Result<(Uuid, ServerStats)> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Snapshot { reply })
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)
    }

    pub async fn shutdown(self) {
        let mut this = self;
        this.cancel.cancel();
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub async fn spawn_coordinator(config: CoordinatorConfig) -> Result<CoordinatorHandle> {
    config.validate()?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(
        event = "coordinator.listening",
        addr = %local_addr,
        task_timeout_ms = config.task_timeout.as_millis() as u64,
        master_grace_ms = config.master_grace.as_millis() as u64,
        "coordinator.listening"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let accept_events = events_tx.clone();
    let accept_cancel = cancel.clone();
    let actor_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let actor = CoordinatorActor::new(config);
        tokio::select! {
            _ = actor.run(events_rx, actor_cancel) => {}
            _ = accept_loop(listener, accept_events, accept_cancel) => {}
        }
    });

    Ok(CoordinatorHandle {
        local_addr,
        events: events_tx,
        cancel,
        task: Some(task),
    })
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    let mut next_conn_id: ConnId = 0;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(x) => x,
            Err(e) => {
                warn!(
                    event = "coordinator.accept_failed",
                    error = %e,
                    "coordinator.accept_failed"
                );
                sleep(Duration::from_millis(200)).await;
                continue;
            }
        };
        next_conn_id += 1;
        debug!(
            event = "coordinator.connection_accepted",
            conn_id = next_conn_id,
            peer = %peer,
            "coordinator.connection_accepted"
        );
        tokio::spawn(serve_connection(
            stream,
            next_conn_id,
            events.clone(),
            cancel.child_token(),
        ));
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn_id: ConnId,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(
                event = "coordinator.handshake_failed",
                conn_id,
                error = %e,
                "coordinator.handshake_failed"
            );
            return;
        }
    };
    let (mut sink, mut frames) = ws.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    if events.send(Event::Connected { conn_id, outbound }).is_err() {
        return;
    }

    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut assembler = PayloadAssembler::new();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(
                    event = "coordinator.read_failed",
                    conn_id,
                    error = %e,
                    "coordinator.read_failed"
                );
                break;
            }
            None => break,
        };

        match decode_frame(conn_id, frame, &mut assembler) {
            Ok(Some(event)) => {
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = events.send(Event::Violation {
                    conn_id,
                    message: e.wire_message(),
                });
                break;
            }
        }
    }
    let _ = events.send(Event::Closed { conn_id });
}

fn decode_frame(
    conn_id: ConnId,
    frame: WsMessage,
    assembler: &mut PayloadAssembler,
) -> Result<Option<Event>> {
    match frame {
        WsMessage::Text(text) => {
            let message = Message::decode(&text)?;
            assembler.check_text_allowed(message.kind())?;
            match message {
                Message::Task(header) => {
                    assembler.expect_payload(header)?;
                    Ok(None)
                }
                message => Ok(Some(Event::Text { conn_id, message })),
            }
        }
        WsMessage::Binary(bytes) => {
            let (header, bytes) = assembler.accept_binary(bytes)?;
            Ok(Some(Event::Payload {
                conn_id,
                header,
                bytes,
            }))
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_) => {
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peer {
    Unregistered,
    Master(Uuid),
    Worker(WorkerId),
}

struct Conn {
    outbound: mpsc::UnboundedSender<WsMessage>,
    peer: Peer,
}

struct CoordinatorActor {
    config: CoordinatorConfig,
    session: Session,
    conns: HashMap<ConnId, Conn>,
    worker_conns: HashMap<WorkerId, ConnId>,
    master_conn: Option<ConnId>,
    declared: VecDeque<TaskHeader>,
    declared_batch: usize,
    grace_deadline: Option<Instant>,
}

impl CoordinatorActor {
    fn new(config: CoordinatorConfig) -> Self {
        let session = Session::new(config.max_queue_len);
        info!(
            event = "session.created",
            session_id = %session.id(),
            "session.created"
        );
        Self {
            config,
            session,
            conns: HashMap::new(),
            worker_conns: HashMap::new(),
            master_conn: None,
            declared: VecDeque::new(),
            declared_batch: 0,
            grace_deadline: None,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let rate_deadline = self.session.rate_limit_until().map(|until| {
                Instant::now() + Duration::from_millis(until.saturating_sub(now_unix_ms()))
            });
            let grace_deadline = self.grace_deadline;

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sleep_until_opt(rate_deadline) => {
                    let effects = self.session.resume_if_elapsed(now_unix_ms());
                    self.apply(effects);
                }
                _ = sleep_until_opt(grace_deadline) => self.expire_master_grace(),
                _ = sweep.tick() => {
                    let effects = self.session.expire_workers(
                        now_unix_ms(),
                        self.config.task_timeout.as_millis() as u64,
                        self.config.heartbeat_timeout.as_millis() as u64,
                    );
                    self.apply(effects);
                }
            }
        }
        info!(event = "coordinator.stopped", "coordinator.stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Connected { conn_id, outbound } => {
                self.conns.insert(
                    conn_id,
                    Conn {
                        outbound,
                        peer: Peer::Unregistered,
                    },
                );
            }
            Event::Text { conn_id, message } => self.on_message(conn_id, message),
            Event::Payload {
                conn_id,
                header,
                bytes,
            } => self.on_payload(conn_id, header, bytes),
            Event::Violation { conn_id, message } => {
                warn!(
                    event = "coordinator.protocol_error",
                    conn_id,
                    error = %message,
                    "coordinator.protocol_error"
                );
                self.reject(conn_id, &message);
            }
            Event::Closed { conn_id } => {
                if self.conns.contains_key(&conn_id) {
                    self.drop_conn(conn_id, "connection closed");
                }
            }
            Event::Snapshot { reply } => {
                let _ = reply.send((self.session.id(), self.session.stats()));
            }
        }
    }

    fn on_message(&mut self, conn_id: ConnId, message: Message) {
        let Some(peer) = self.conns.get(&conn_id).map(|c| c.peer) else {
            return;
        };
        let now = now_unix_ms();

        match (peer, message) {
            (Peer::Unregistered, Message::Register { role, session_id }) => {
                self.on_register(conn_id, role, session_id)
            }
            (_, Message::GetStats) if peer != Peer::Unregistered => {
                self.send(
                    conn_id,
                    &Message::Stats {
                        server_stats: self.session.stats(),
                    },
                );
            }
            (Peer::Worker(worker_id), Message::Heartbeat) => {
                self.session.heartbeat(&worker_id, now);
            }
            (Peer::Master(_), Message::Heartbeat) => {}
            (Peer::Master(_), Message::SubmitTasks { tasks }) => self.on_submit(conn_id, tasks),
            (
                Peer::Worker(worker_id),
                Message::TaskResult {
                    task_id,
                    result,
                    stats,
                },
            ) => {
                debug!(
                    event = "coordinator.task_result",
                    worker_id = %worker_id,
                    task_id = %task_id,
                    success = result.success,
                    reported_completed = stats.completed,
                    reported_failed = stats.failed,
                    "coordinator.task_result"
                );
                let effects = self.session.task_result(now, &worker_id, &task_id, result);
                self.apply(effects);
            }
            (
                Peer::Worker(worker_id),
                Message::RateLimitHit {
                    task_id,
                    retry_after_ms,
                },
            ) => {
                let effects = self
                    .session
                    .rate_limit_hit(now, &worker_id, &task_id, retry_after_ms);
                self.apply(effects);
            }
            (peer, message) => {
                let reason = match peer {
                    Peer::Unregistered => format!("expected register, got {}", message.kind()),
                    Peer::Master(_) => format!("{} is not valid from a master", message.kind()),
                    Peer::Worker(_) => format!("{} is not valid from a worker", message.kind()),
                };
                warn!(
                    event = "coordinator.protocol_error",
                    conn_id,
                    error = %reason,
                    "coordinator.protocol_error"
                );
                self.reject(conn_id, &reason);
            }
        }
    }

    fn on_register(&mut self, conn_id: ConnId, role: Role, resume: Option<Uuid>) {
        match role {
            Role::Master => match self.session.register_master(resume) {
                Ok((master_id, replay)) => {
                    self.set_peer(conn_id, Peer::Master(master_id));
                    self.master_conn = Some(conn_id);
                    self.grace_deadline = None;
                    self.send_registered(conn_id, master_id);
                    self.apply(replay);
                }
                Err(e) => {
                    warn!(
                        event = "coordinator.master_rejected",
                        conn_id,
                        error = %e,
                        "coordinator.master_rejected"
                    );
                    self.reject(conn_id, &e.wire_message());
                }
            },
            Role::Worker => {
                let (worker_id, effects) = self.session.register_worker(now_unix_ms());
                self.set_peer(conn_id, Peer::Worker(worker_id));
                self.worker_conns.insert(worker_id, conn_id);
                self.send_registered(conn_id, worker_id);
                self.apply(effects);
            }
        }
    }

    fn on_submit(&mut self, conn_id: ConnId, tasks: Vec<TaskHeader>) {
        let mut seen: HashSet<Uuid> = self.declared.iter().map(|h| h.task_id).collect();
        for h in &tasks {
            if !seen.insert(h.task_id) {
                self.reject(conn_id, &format!("duplicate task id {}", h.task_id));
                return;
            }
        }
        if let Err(e) = self
            .session
            .check_capacity(self.declared.len() + tasks.len())
        {
            self.reject(conn_id, &e.wire_message());
            return;
        }

        info!(
            event = "coordinator.tasks_declared",
            count = tasks.len(),
            "coordinator.tasks_declared"
        );
        if tasks.is_empty() && self.declared.is_empty() {
            self.send(
                conn_id,
                &Message::TasksSubmitted {
                    count: 0,
                    total_pending: self.session.queue().len(),
                },
            );
            return;
        }
        self.session.declare_tasks(tasks.len());
        self.declared_batch += tasks.len();
        self.declared.extend(tasks);
    }

    fn on_payload(&mut self, conn_id: ConnId, header: TaskHeader, bytes: Vec<u8>) {
        let is_master = matches!(
            self.conns.get(&conn_id).map(|c| c.peer),
            Some(Peer::Master(_))
        );
        if !is_master {
            self.reject(conn_id, "task payloads are only accepted from the master");
            return;
        }
        if self.declared.front() != Some(&header) {
            self.reject(
                conn_id,
                &format!("payload for task {} was not declared in order", header.task_id),
            );
            return;
        }
        self.declared.pop_front();

        match self.session.submit_task(now_unix_ms(), header, bytes) {
            Ok(effects) => self.apply(effects),
            Err(e) => {
                self.reject(conn_id, &e.wire_message());
                return;
            }
        }

        if self.declared.is_empty() {
            let count = std::mem::take(&mut self.declared_batch);
            info!(
                event = "coordinator.tasks_submitted",
                count,
                pending = self.session.queue().len(),
                "coordinator.tasks_submitted"
            );
            self.send(
                conn_id,
                &Message::TasksSubmitted {
                    count,
                    total_pending: self.session.queue().len(),
                },
            );
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Assign {
                    worker_id,
                    header,
                    payload,
                } => {
                    let Some(conn_id) = self.worker_conns.get(&worker_id).copied() else {
                        continue;
                    };
                    self.send(conn_id, &Message::Assign(header));
                    if let Some(conn) = self.conns.get(&conn_id) {
                        let _ = conn.outbound.send(WsMessage::Binary(payload));
                    }
                }
                Effect::ToMaster(message) => {
                    if let Some(conn_id) = self.master_conn {
                        self.send(conn_id, &message);
                    }
                }
                Effect::CloseWorker { worker_id, reason } => {
                    if let Some(conn_id) = self.worker_conns.remove(&worker_id) {
                        self.send(conn_id, &Message::DisconnectNotice { reason });
                        self.conns.remove(&conn_id);
                    }
                }
            }
        }
    }

    fn expire_master_grace(&mut self) {
        self.grace_deadline = None;
        if self.session.master_connected() {
            return;
        }
        let effects = self.session.teardown("master did not reconnect");
        self.apply(effects);

        self.session = Session::new(self.config.max_queue_len);
        self.declared.clear();
        self.declared_batch = 0;
        info!(
            event = "session.created",
            session_id = %self.session.id(),
            "session.created"
        );
    }

    fn reject(&mut self, conn_id: ConnId, message: &str) {
        self.send(conn_id, &Message::error(message));
        self.drop_conn(conn_id, message);
    }

    fn drop_conn(&mut self, conn_id: ConnId, reason: &str) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        debug!(
            event = "coordinator.connection_dropped",
            conn_id,
            reason,
            "coordinator.connection_dropped"
        );
        match conn.peer {
            Peer::Unregistered => {}
            Peer::Worker(worker_id) => {
                self.worker_conns.remove(&worker_id);
                let cause = Error::worker_lost(reason);
                let effects = self.session.worker_lost(now_unix_ms(), &worker_id, &cause);
                self.apply(effects);
            }
            Peer::Master(_) => {
                if self.master_conn == Some(conn_id) {
                    self.master_conn = None;
                    self.session.master_disconnected();
                    self.declared.clear();
                    self.declared_batch = 0;
                    if self.session.has_outstanding_work() {
                        self.grace_deadline = Some(Instant::now() + self.config.master_grace);
                    } else {
                        let previous = self.session.recycle();
                        info!(
                            event = "session.created",
                            session_id = %self.session.id(),
                            previous = %previous,
                            workers = self.session.registry().len(),
                            "session.created"
                        );
                    }
                }
            }
        }
    }

    fn set_peer(&mut self, conn_id: ConnId, peer: Peer) {
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.peer = peer;
        }
    }

    fn send_registered(&self, conn_id: ConnId, assigned_id: Uuid) {
        self.send(
            conn_id,
            &Message::Registered {
                assigned_id,
                session_id: self.session.id(),
                server_stats: self.session.stats(),
            },
        );
    }

    fn send(&self, conn_id: ConnId, message: &Message) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        match message.encode() {
            Ok(text) => {
                let _ = conn.outbound.send(WsMessage::Text(text));
            }
            Err(e) => {
                error!(
                    event = "coordinator.encode_failed",
                    kind = message.kind(),
                    error = %e,
                    "coordinator.encode_failed"
                );
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
