use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{Message, TaskHeader, UploadProgress, UploadResult};
use crate::status::{ServerStats, WorkerStats, WorkerStatus, WorkerSummary};
use crate::{Error, Result};

pub type TaskId = Uuid;
pub type WorkerId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Assigned(WorkerId),
    Completed,
    Failed(String),
}

impl TaskState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned(_) => "assigned",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

#[derive(Debug)]
struct TaskEntry {
    header: TaskHeader,
    payload: Option<Vec<u8>>,
    state: TaskState,
    assigned_at_ms: Option<u64>,
}

/// FIFO of pending task ids.
#[derive(Debug, Default)]
pub struct TaskQueue {
    order: VecDeque<TaskId>,
}

impl TaskQueue {
    pub fn push_back(&mut self, id: TaskId) {
        self.order.push_back(id);
    }

    pub fn push_front(&mut self, id: TaskId) {
        self.order.push_front(id);
    }

    pub fn pop_front(&mut self) -> Option<TaskId> {
        self.order.pop_front()
    }

    pub fn front(&self) -> Option<&TaskId> {
        self.order.front()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub stats: WorkerStats,
    pub current_task: Option<TaskId>,
    pub last_seen_ms: u64,
    idle_seq: u64,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerEntry>,
    next_seq: u64,
}

impl WorkerRegistry {
    pub fn register(&mut self, now_ms: u64) -> WorkerId {
        let id = Uuid::new_v4();
        let idle_seq = self.bump();
        self.workers.insert(
            id,
            WorkerEntry {
                id,
                status: WorkerStatus::Idle,
                stats: WorkerStats::default(),
                current_task: None,
                last_seen_ms: now_ms,
                idle_seq,
            },
        );
        id
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerEntry> {
        self.workers.get(id)
    }

    pub fn remove(&mut self, id: &WorkerId) -> Option<WorkerEntry> {
        self.workers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub fn idle_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count()
    }

    /// The idle worker that has waited longest, so load rotates across idles.
    pub fn next_idle(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .min_by_key(|w| w.idle_seq)
            .map(|w| w.id)
    }

    pub fn touch(&mut self, id: &WorkerId, now_ms: u64) -> bool {
        match self.workers.get_mut(id) {
            Some(w) => {
                w.last_seen_ms = now_ms;
                true
            }
            None => false,
        }
    }

    fn mark_busy(&mut self, id: &WorkerId, task: TaskId) {
        if let Some(w) = self.workers.get_mut(id) {
            w.status = WorkerStatus::Busy;
            w.current_task = Some(task);
        }
    }

    fn mark_idle(&mut self, id: &WorkerId) {
        let seq = self.bump();
        if let Some(w) = self.workers.get_mut(id) {
            w.status = WorkerStatus::Idle;
            w.current_task = None;
            w.idle_seq = seq;
        }
    }

    fn stats_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerStats> {
        self.workers.get_mut(id).map(|w| &mut w.stats)
    }

    fn summaries(&self) -> Vec<WorkerSummary> {
        let mut out: Vec<WorkerSummary> = self
            .workers
            .values()
            .map(|w| WorkerSummary {
                id: w.id,
                status: w.status,
                stats: w.stats,
            })
            .collect();
        out.sort_by_key(|w| w.id);
        out
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Wire work produced by a session transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send `assign` followed by the binary payload.
    Assign {
        worker_id: WorkerId,
        header: TaskHeader,
        payload: Vec<u8>,
    },
    ToMaster(Message),
    /// Notify the worker and close its connection.
    CloseWorker { worker_id: WorkerId, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Queue and registry for one master's batch. No I/O: mutating calls take
/// the current time and return the [`Effect`]s to carry out.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    master_id: Option<Uuid>,
    master_connected: bool,
    master_backlog: Vec<Message>,
    registry: WorkerRegistry,
    queue: TaskQueue,
    tasks: HashMap<TaskId, TaskEntry>,
    rate_limit_until: Option<u64>,
    completed: usize,
    failed: usize,
    /// Payloads announced by `submitTasks` that have not arrived yet.
    undelivered: usize,
    max_queue_len: Option<usize>,
}

impl Session {
    pub fn new(max_queue_len: Option<usize>) -> Self {
        Self {
            id: Uuid::new_v4(),
            master_id: None,
            master_connected: false,
            master_backlog: Vec::new(),
            registry: WorkerRegistry::default(),
            queue: TaskQueue::default(),
            tasks: HashMap::new(),
            rate_limit_until: None,
            completed: 0,
            failed: 0,
            undelivered: 0,
            max_queue_len,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn master_connected(&self) -> bool {
        self.master_connected
    }

    pub fn rate_limit_until(&self) -> Option<u64> {
        self.rate_limit_until
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn task_state(&self, id: &TaskId) -> Option<&TaskState> {
        self.tasks.get(id).map(|t| &t.state)
    }

    pub fn counts(&self) -> TaskCounts {
        let mut c = TaskCounts {
            total: self.tasks.len(),
            ..TaskCounts::default()
        };
        for t in self.tasks.values() {
            match t.state {
                TaskState::Pending => c.pending += 1,
                TaskState::Assigned(_) => c.assigned += 1,
                TaskState::Completed => c.completed += 1,
                TaskState::Failed(_) => c.failed += 1,
            }
        }
        c
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            completed: self.completed as u64,
            failed: self.failed as u64,
            total: self.tasks.len() as u64,
            ..UploadProgress::default()
        }
    }

    pub fn stats(&self) -> ServerStats {
        let counts = self.counts();
        ServerStats {
            worker_count: self.registry.len(),
            idle_workers: self.registry.idle_count(),
            pending_tasks: counts.pending,
            active_tasks: counts.assigned,
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            rate_limited: self.rate_limit_until.is_some(),
            workers: self.registry.summaries(),
        }
    }

    /// Registers the master. A master that dropped may come back with the
    /// session id it was given and receives everything buffered meanwhile.
    pub fn register_master(&mut self, resume: Option<Uuid>) -> Result<(Uuid, Vec<Effect>)> {
        if let Some(session_id) = resume
            && session_id != self.id
        {
            return Err(Error::protocol(format!("unknown session {session_id}")));
        }
        if self.master_connected {
            return Err(Error::protocol("session already has a master"));
        }

        match self.master_id {
            None => {
                let id = Uuid::new_v4();
                self.master_id = Some(id);
                self.master_connected = true;
                info!(
                    event = "session.master_registered",
                    session_id = %self.id,
                    master_id = %id,
                    "session.master_registered"
                );
                Ok((id, Vec::new()))
            }
            Some(id) if resume == Some(self.id) => {
                self.master_connected = true;
                let effects: Vec<Effect> = self
                    .master_backlog
                    .drain(..)
                    .map(Effect::ToMaster)
                    .collect();
                info!(
                    event = "session.master_resumed",
                    session_id = %self.id,
                    master_id = %id,
                    replayed = effects.len(),
                    "session.master_resumed"
                );
                Ok((id, effects))
            }
            Some(_) => Err(Error::protocol(
                "session is held for a disconnected master; resume with its session id",
            )),
        }
    }

    pub fn master_disconnected(&mut self) {
        if self.master_connected {
            self.master_connected = false;
            self.undelivered = 0;
            info!(
                event = "session.master_disconnected",
                session_id = %self.id,
                pending = self.queue.len(),
                "session.master_disconnected"
            );
        }
    }

    /// Whether anything submitted is still queued, assigned or on its way.
    pub fn has_outstanding_work(&self) -> bool {
        let counts = self.counts();
        counts.pending > 0 || counts.assigned > 0 || self.undelivered > 0
    }

    /// Starts a fresh session for the next master. Registered workers carry
    /// over, and so does an active rate-limit pause. Returns the old id.
    pub fn recycle(&mut self) -> Uuid {
        let previous = self.id;
        let registry = std::mem::take(&mut self.registry);
        let rate_limit_until = self.rate_limit_until;
        *self = Session::new(self.max_queue_len);
        self.registry = registry;
        self.rate_limit_until = rate_limit_until;
        previous
    }

    pub fn register_worker(&mut self, now_ms: u64) -> (WorkerId, Vec<Effect>) {
        let id = self.registry.register(now_ms);
        info!(
            event = "session.worker_registered",
            session_id = %self.id,
            worker_id = %id,
            workers = self.registry.len(),
            "session.worker_registered"
        );
        let effects = self.assign_pending(now_ms);
        (id, effects)
    }

    pub fn heartbeat(&mut self, worker_id: &WorkerId, now_ms: u64) {
        self.registry.touch(worker_id, now_ms);
    }

    /// Checks that `incoming` more tasks fit under the queue bound.
    pub fn check_capacity(&self, incoming: usize) -> Result<()> {
        match self.max_queue_len {
            Some(max) if self.queue.len() + incoming > max => Err(Error::protocol(format!(
                "queue full: {} pending + {incoming} submitted exceeds {max}",
                self.queue.len()
            ))),
            _ => Ok(()),
        }
    }

    /// Records that `count` payloads are on their way. The session is not
    /// complete while any of them is outstanding.
    pub fn declare_tasks(&mut self, count: usize) {
        self.undelivered += count;
    }

    pub fn submit_task(
        &mut self,
        now_ms: u64,
        header: TaskHeader,
        payload: Vec<u8>,
    ) -> Result<Vec<Effect>> {
        if self.tasks.contains_key(&header.task_id) {
            return Err(Error::protocol(format!(
                "duplicate task id {}",
                header.task_id
            )));
        }
        self.check_capacity(1)?;
        self.undelivered = self.undelivered.saturating_sub(1);

        let task_id = header.task_id;
        debug!(
            event = "task.transition",
            task_id = %task_id,
            from = "none",
            to = "pending",
            filename = %header.filename,
            "task.transition"
        );
        self.tasks.insert(
            task_id,
            TaskEntry {
                header,
                payload: Some(payload),
                state: TaskState::Pending,
                assigned_at_ms: None,
            },
        );
        self.queue.push_back(task_id);
        Ok(self.assign_pending(now_ms))
    }

    /// Hands pending tasks to idle workers until one of the three runs out
    /// or the session is paused for rate limiting.
    pub fn assign_pending(&mut self, now_ms: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.rate_limit_until.is_some() {
            return effects;
        }

        while !self.queue.is_empty() {
            let Some(worker_id) = self.registry.next_idle() else {
                break;
            };
            let Some(task_id) = self.queue.pop_front() else {
                break;
            };
            let Some(entry) = self.tasks.get(&task_id) else {
                continue;
            };
            if entry.state != TaskState::Pending {
                continue;
            }
            let Some(payload) = entry.payload.clone() else {
                continue;
            };
            let header = entry.header.clone();

            self.set_state(&task_id, TaskState::Assigned(worker_id));
            if let Some(entry) = self.tasks.get_mut(&task_id) {
                entry.assigned_at_ms = Some(now_ms);
            }
            self.registry.mark_busy(&worker_id, task_id);

            info!(
                event = "coordinator.task_assigned",
                task_id = %task_id,
                worker_id = %worker_id,
                filename = %header.filename,
                remaining = self.queue.len(),
                "coordinator.task_assigned"
            );
            effects.push(Effect::Assign {
                worker_id,
                header,
                payload,
            });
        }
        effects
    }

    pub fn task_result(
        &mut self,
        now_ms: u64,
        worker_id: &WorkerId,
        task_id: &TaskId,
        result: UploadResult,
    ) -> Vec<Effect> {
        self.registry.touch(worker_id, now_ms);

        let assigned_here = matches!(
            self.tasks.get(task_id).map(|t| &t.state),
            Some(TaskState::Assigned(w)) if w == worker_id
        );
        if !assigned_here {
            warn!(
                event = "coordinator.stale_result",
                task_id = %task_id,
                worker_id = %worker_id,
                "coordinator.stale_result"
            );
            return Vec::new();
        }

        let size = self.tasks.get(task_id).map(|t| t.header.size).unwrap_or(0);
        if result.success {
            self.set_state(task_id, TaskState::Completed);
            self.completed += 1;
            if let Some(stats) = self.registry.stats_mut(worker_id) {
                stats.completed += 1;
                stats.total_bytes += size;
            }
        } else {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "upload failed".to_string());
            self.set_state(task_id, TaskState::Failed(reason));
            self.failed += 1;
            if let Some(stats) = self.registry.stats_mut(worker_id) {
                stats.failed += 1;
            }
        }
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.payload = None;
            entry.assigned_at_ms = None;
        }
        self.registry.mark_idle(worker_id);

        let mut effects = Vec::new();
        let mut progress = self.progress();
        progress.current_file = Some(result.filename.clone());
        self.to_master(
            Message::Progress {
                task_id: *task_id,
                result,
                progress,
            },
            &mut effects,
        );

        let counts = self.counts();
        if counts.pending == 0 && counts.assigned == 0 && self.undelivered == 0 {
            self.to_master(
                Message::SessionComplete {
                    progress: self.progress(),
                },
                &mut effects,
            );
        }

        effects.extend(self.assign_pending(now_ms));
        effects
    }

    /// Pauses assignment session-wide. The reporting worker's task goes back
    /// to the head of the queue without being charged as a failure.
    pub fn rate_limit_hit(
        &mut self,
        now_ms: u64,
        worker_id: &WorkerId,
        task_id: &TaskId,
        retry_after_ms: u64,
    ) -> Vec<Effect> {
        self.registry.touch(worker_id, now_ms);

        let until = now_ms.saturating_add(retry_after_ms);
        let until = self.rate_limit_until.map_or(until, |cur| cur.max(until));
        self.rate_limit_until = Some(until);

        let mut filename = None;
        let held = matches!(
            self.tasks.get(task_id).map(|t| &t.state),
            Some(TaskState::Assigned(w)) if w == worker_id
        );
        if held {
            filename = self.tasks.get(task_id).map(|t| t.header.filename.clone());
            self.requeue_front(task_id);
            self.registry.mark_idle(worker_id);
        }

        warn!(
            event = "coordinator.rate_limited",
            worker_id = %worker_id,
            task_id = %task_id,
            retry_after_ms,
            until_ms = until,
            "coordinator.rate_limited"
        );

        let mut effects = Vec::new();
        let progress = UploadProgress {
            current_file: filename,
            waiting_for: Some(until.saturating_sub(now_ms)),
            wait_start: Some(now_ms),
            waiting_worker_id: Some(*worker_id),
            ..self.progress()
        };
        self.to_master(Message::Waiting { progress }, &mut effects);
        effects
    }

    /// Clears an elapsed rate-limit pause and resumes assignment.
    pub fn resume_if_elapsed(&mut self, now_ms: u64) -> Vec<Effect> {
        match self.rate_limit_until {
            Some(until) if until <= now_ms => {
                self.rate_limit_until = None;
                info!(
                    event = "coordinator.rate_limit_cleared",
                    session_id = %self.id,
                    pending = self.queue.len(),
                    "coordinator.rate_limit_cleared"
                );
                self.assign_pending(now_ms)
            }
            _ => Vec::new(),
        }
    }

    /// Drops a worker; its in-flight task returns to the queue head.
    pub fn worker_lost(&mut self, now_ms: u64, worker_id: &WorkerId, cause: &Error) -> Vec<Effect> {
        let Some(entry) = self.registry.remove(worker_id) else {
            return Vec::new();
        };
        info!(
            event = "session.worker_removed",
            worker_id = %worker_id,
            cause = %cause,
            current_task = ?entry.current_task,
            "session.worker_removed"
        );
        if let Some(task_id) = entry.current_task {
            self.requeue_front(&task_id);
        }
        self.assign_pending(now_ms)
    }

    /// Forces out workers that sat on a task past `task_timeout_ms` or went
    /// silent past `heartbeat_timeout_ms`.
    pub fn expire_workers(
        &mut self,
        now_ms: u64,
        task_timeout_ms: u64,
        heartbeat_timeout_ms: u64,
    ) -> Vec<Effect> {
        let mut expired = Vec::new();
        for w in self.registry.workers.values() {
            let task_overdue = w
                .current_task
                .and_then(|t| self.tasks.get(&t))
                .and_then(|t| t.assigned_at_ms)
                .is_some_and(|at| now_ms.saturating_sub(at) >= task_timeout_ms);
            let silent = now_ms.saturating_sub(w.last_seen_ms) >= heartbeat_timeout_ms;
            if task_overdue {
                expired.push((w.id, "task timeout"));
            } else if silent {
                expired.push((w.id, "heartbeat timeout"));
            }
        }

        let mut effects = Vec::new();
        for (worker_id, reason) in expired {
            warn!(
                event = "coordinator.worker_expired",
                worker_id = %worker_id,
                reason,
                "coordinator.worker_expired"
            );
            effects.push(Effect::CloseWorker {
                worker_id,
                reason: reason.to_string(),
            });
            let cause = Error::worker_lost(reason);
            effects.extend(self.worker_lost(now_ms, &worker_id, &cause));
        }
        effects
    }

    /// Closes every worker. Used when the master's grace period runs out.
    pub fn teardown(&mut self, reason: &str) -> Vec<Effect> {
        let counts = self.counts();
        info!(
            event = "session.teardown",
            session_id = %self.id,
            reason,
            pending = counts.pending,
            assigned = counts.assigned,
            "session.teardown"
        );
        self.registry
            .ids()
            .into_iter()
            .map(|worker_id| Effect::CloseWorker {
                worker_id,
                reason: reason.to_string(),
            })
            .collect()
    }

    fn requeue_front(&mut self, task_id: &TaskId) {
        let requeue = matches!(
            self.tasks.get(task_id).map(|t| &t.state),
            Some(TaskState::Assigned(_))
        );
        if !requeue {
            return;
        }
        self.set_state(task_id, TaskState::Pending);
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.assigned_at_ms = None;
        }
        self.queue.push_front(*task_id);
    }

    fn set_state(&mut self, task_id: &TaskId, to: TaskState) {
        if let Some(entry) = self.tasks.get_mut(task_id) {
            debug!(
                event = "task.transition",
                task_id = %task_id,
                from = entry.state.label(),
                to = to.label(),
                "task.transition"
            );
            entry.state = to;
        }
    }

    fn to_master(&mut self, message: Message, effects: &mut Vec<Effect>) {
        if self.master_connected {
            effects.push(Effect::ToMaster(message));
        } else if self.master_id.is_some() {
            self.master_backlog.push(message);
        }
    }
}
