//! Transfer scheduler.
//!
//! Owns the lifecycle of every [`TransferTask`]:
//!
//! ```text
//! queued --admitted--> downloading --verified--> completed
//!                      downloading --recoverable error--> queued (backoff)
//!                      downloading --budget exhausted / terminal--> failed
//!                      downloading --pause or network lost--> paused
//! paused --resume--> queued
//! queued/downloading/paused --cancel--> removed
//! ```
//!
//! # Concurrency Model
//!
//! - One coordinating loop consumes an unbounded channel of progress,
//!   completion and wake-up messages
//! - Every state mutation happens under a single `tokio::sync::Mutex`, and
//!   is written to the task store before the lock is released
//! - Each admitted task runs on its own tokio task, outside the lock; only
//!   its result re-enters the loop
//! - Commits, resource deletion and cache eviction move files outside the
//!   lock; a finished attempt keeps its slot until its commit is settled
//! - At most `max_concurrent_transfers` attempts are active at once
//!
//! Requests for a unit that already has a live task attach a waiter to it
//! instead of creating a second transfer.

mod error;
mod job;
mod recovery;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

pub use error::SchedulerError;
pub use recovery::RecoveryReport;

use crate::api::ContentApi;
use crate::clock::{duration_millis, now_millis};
use crate::config::OfflineSettings;
use crate::content::{ContentError, ContentStore, Tier};
use crate::events::{EventBus, TransferEvent};
use crate::network::NetworkMonitor;
use crate::store::{
    NewTask, PauseReason, Priority, RecordAggregate, RecordStore, RetryUpdate, StoreError, TaskId,
    TaskStatus, TaskStore, TransferTask,
};
use crate::transfer::{
    FailureType, ProgressSink, ResumeToken, RetryDecision, RetryPolicy, StopHandle, StopReason,
    TransferError, TransferExecutor, TransferOutcome, TransferProgress, classify_error,
    server_retry_delay,
};

/// Scheduler limits derived from [`OfflineSettings`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_transfers: usize,
    /// Retry budget written into new tasks.
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    /// Ephemeral tier budget enforced after each cache commit.
    pub ephemeral_cache_limit_bytes: Option<u64>,
}

impl SchedulerConfig {
    #[must_use]
    pub fn from_settings(settings: &OfflineSettings) -> Self {
        Self {
            max_concurrent_transfers: settings.max_concurrent_transfers.max(1),
            max_retries: settings.max_retries,
            retry_policy: RetryPolicy::from_settings(settings),
            ephemeral_cache_limit_bytes: settings.ephemeral_cache_limit_bytes,
        }
    }
}

/// Components the scheduler drives. One instance of each, built at startup.
pub struct SchedulerDeps {
    pub tasks: TaskStore,
    pub records: RecordStore,
    pub content: Arc<ContentStore>,
    pub executor: TransferExecutor,
    pub api: Arc<dyn ContentApi>,
    pub network: NetworkMonitor,
    pub events: EventBus,
}

/// A request to make one unit available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub id: TaskId,
    pub tier: Tier,
    pub priority: Priority,
}

/// What [`Scheduler::enqueue`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A task was created, or a failed/vanished one was restarted.
    Created,
    /// A live task already existed; the request joined it.
    Attached,
    /// The payload is already stored; nothing was queued.
    AlreadyCompleted,
}

/// How a task ended, as seen by its waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { path: PathBuf },
    Failed { error: String, failure: FailureType },
    /// Cancelled or deleted before finishing.
    Removed,
    /// The scheduler shut down first.
    Interrupted,
}

/// Handle returned by [`Scheduler::enqueue`].
#[derive(Debug)]
pub struct TaskTicket {
    id: TaskId,
    outcome: EnqueueOutcome,
    receiver: oneshot::Receiver<TaskOutcome>,
}

impl TaskTicket {
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn outcome(&self) -> EnqueueOutcome {
        self.outcome
    }

    /// Waits until the task completes, fails or is removed.
    pub async fn wait(self) -> TaskOutcome {
        self.receiver.await.unwrap_or(TaskOutcome::Interrupted)
    }
}

/// Why the scheduler asked an active transfer to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopIntent {
    Pause(PauseReason),
    Cancel,
    Shutdown,
}

#[derive(Debug)]
struct ActiveTransfer {
    attempt: u64,
    stop: StopHandle,
    intent: Option<StopIntent>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    active: HashMap<TaskId, ActiveTransfer>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<TaskOutcome>>>,
    /// Admission is enabled once startup recovery has run.
    started: bool,
    stopping: bool,
    shutdown_reply: Option<oneshot::Sender<()>>,
    /// Unix ms of the pending backoff wake-up, if one is scheduled.
    wakeup_at: Option<i64>,
    /// Resources whose files are being deleted; not admitted until done.
    removing: HashSet<String>,
}

enum SchedulerMsg {
    Tick,
    Progress {
        id: TaskId,
        attempt: u64,
        progress: TransferProgress,
    },
    Finished {
        id: TaskId,
        attempt: u64,
        outcome: TransferOutcome,
    },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Inner {
    tasks: TaskStore,
    records: RecordStore,
    content: Arc<ContentStore>,
    executor: TransferExecutor,
    api: Arc<dyn ContentApi>,
    network: NetworkMonitor,
    events: EventBus,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    next_attempt: AtomicU64,
}

/// The transfer scheduler. Cloning shares the same instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Builds the scheduler and spawns its coordinating loop.
    ///
    /// Nothing is admitted until [`Scheduler::start`] is called, so
    /// [`Scheduler::recover`] can run first. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(
            max_concurrent = config.max_concurrent_transfers,
            max_retries = config.max_retries,
            "creating scheduler"
        );
        let inner = Arc::new(Inner {
            tasks: deps.tasks,
            records: deps.records,
            content: deps.content,
            executor: deps.executor,
            api: deps.api,
            network: deps.network,
            events: deps.events,
            config,
            state: Mutex::new(SchedulerState::default()),
            tx,
            next_attempt: AtomicU64::new(1),
        });
        tokio::spawn(run_loop(Arc::clone(&inner), rx));
        Self { inner }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Enables admission and runs a first pass.
    pub async fn start(&self) {
        self.inner.state.lock().await.started = true;
        info!("scheduler started");
        self.tick();
    }

    /// Asks the loop to run an admission pass.
    pub fn tick(&self) {
        let _ = self.inner.tx.send(SchedulerMsg::Tick);
    }

    /// Number of attempts currently running or settling.
    pub async fn active_transfers(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    /// Creates a task for a unit, or joins the live one.
    ///
    /// - no task: insert a queued task
    /// - live task: attach; a persistent request upgrades an ephemeral
    ///   destination and priority only ever rises
    /// - failed task: restart it with a fresh retry budget
    /// - completed task: no-op, promoting a cached payload to the
    ///   persistent tier when asked for it; if the payload is gone the task
    ///   restarts
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] or [`SchedulerError::Content`] if the
    /// request cannot be recorded, [`SchedulerError::ShutDown`] after shutdown.
    #[instrument(skip(self, request), fields(task = %request.id, tier = %request.tier, priority = %request.priority))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskTicket, SchedulerError> {
        let inner = &self.inner;
        let (tx, receiver) = oneshot::channel();
        let mut reply = Some(tx);

        let outcome = {
            let mut state = inner.state.lock().await;
            if state.stopping {
                return Err(SchedulerError::ShutDown);
            }

            let outcome = match inner.tasks.get(&request.id).await? {
                None => {
                    let task = inner
                        .tasks
                        .insert(&NewTask {
                            id: request.id.clone(),
                            source_location: None,
                            destination_tier: request.tier,
                            priority: request.priority,
                            bytes_total: None,
                            max_retries: inner.config.max_retries,
                        })
                        .await?;
                    inner.emit_status(&task, None);
                    EnqueueOutcome::Created
                }
                Some(task) if task.status == TaskStatus::Completed => {
                    if let Some(path) = inner.settle_completed(&task, &request).await? {
                        if let Some(tx) = reply.take() {
                            let _ = tx.send(TaskOutcome::Completed { path });
                        }
                        EnqueueOutcome::AlreadyCompleted
                    } else {
                        debug!("completed payload missing; downloading again");
                        inner.restart(&task, &request).await?;
                        EnqueueOutcome::Created
                    }
                }
                Some(task) if task.status == TaskStatus::Failed => {
                    inner.restart(&task, &request).await?;
                    EnqueueOutcome::Created
                }
                Some(task) => {
                    let tier = task.destination_tier.max(request.tier);
                    let priority = task.priority.max(request.priority);
                    if tier != task.destination_tier || priority != task.priority {
                        debug!(%tier, %priority, "upgrading live task");
                        inner
                            .tasks
                            .update_destination(&task.id, tier, priority)
                            .await?;
                    }
                    EnqueueOutcome::Attached
                }
            };

            if let Some(tx) = reply.take() {
                state.waiters.entry(request.id.clone()).or_default().push(tx);
            }
            outcome
        };

        debug!(?outcome, "enqueued");
        inner.refresh_record(&request.id.resource_id).await;
        self.tick();
        Ok(TaskTicket {
            id: request.id,
            outcome,
            receiver,
        })
    }

    /// Pauses every queued or running task of a resource.
    ///
    /// Running transfers are stopped cooperatively and keep resume data
    /// when the source supports it. Returns how many tasks were paused.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the task store cannot be updated.
    #[instrument(skip(self))]
    pub async fn pause_resource(&self, resource_id: &str) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let mut paused = 0;
        {
            let mut state = inner.state.lock().await;
            for task in inner.tasks.list_for_resource(resource_id).await? {
                let pausable = match task.status {
                    TaskStatus::Queued | TaskStatus::Downloading => true,
                    TaskStatus::Paused => task.pause_reason == Some(PauseReason::Network),
                    TaskStatus::Completed | TaskStatus::Failed => false,
                };
                if !pausable {
                    continue;
                }
                if let Some(active) = state.active.get_mut(&task.id)
                    && active.intent.is_none()
                {
                    active.intent = Some(StopIntent::Pause(PauseReason::User));
                    active.stop.request(StopReason::Pause);
                }
                inner.tasks.mark_paused(&task.id, PauseReason::User).await?;
                inner.emit_transition(&task, TaskStatus::Paused, Some(PauseReason::User), None);
                paused += 1;
            }
        }
        inner.refresh_record(resource_id).await;
        Ok(paused)
    }

    /// Re-queues every paused task of a resource.
    ///
    /// While the network policy forbids transfers the tasks stay paused,
    /// marked as waiting for the network, and are admitted when it returns.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the task store cannot be updated.
    #[instrument(skip(self))]
    pub async fn resume_resource(&self, resource_id: &str) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let can_transfer = inner.network.can_transfer_now();
        let mut resumed = 0;
        {
            let _state = inner.state.lock().await;
            for task in inner.tasks.list_for_resource(resource_id).await? {
                if task.status != TaskStatus::Paused {
                    continue;
                }
                if can_transfer {
                    inner.tasks.requeue(&task.id).await?;
                    inner.emit_transition(&task, TaskStatus::Queued, None, None);
                } else {
                    inner.tasks.mark_paused(&task.id, PauseReason::Network).await?;
                    inner.emit_transition(
                        &task,
                        TaskStatus::Paused,
                        Some(PauseReason::Network),
                        None,
                    );
                }
                resumed += 1;
            }
        }
        inner.refresh_record(resource_id).await;
        self.tick();
        Ok(resumed)
    }

    /// Removes every unfinished task of a resource.
    ///
    /// Running transfers are stopped and their staged bytes discarded;
    /// waiters receive [`TaskOutcome::Removed`]. Completed and failed tasks
    /// are kept. Returns how many tasks were removed.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the task store cannot be updated.
    #[instrument(skip(self))]
    pub async fn cancel_resource(&self, resource_id: &str) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let removed = {
            let mut state = inner.state.lock().await;
            let live: Vec<TransferTask> = inner
                .tasks
                .list_for_resource(resource_id)
                .await?
                .into_iter()
                .filter(|task| !task.status.is_terminal())
                .collect();
            for task in &live {
                inner.cancel_locked(&mut state, &task.id).await?;
            }
            live.len()
        };
        inner.refresh_record(resource_id).await;
        self.tick();
        Ok(removed)
    }

    /// Cancels a resource and deletes all its tasks and stored files.
    ///
    /// Tasks are cancelled under the scheduler lock; the files are deleted
    /// after it is released. A commit that lands in between sees its cancel
    /// and removes its own file, and the resource is not admitted again
    /// until the deletion is done.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] or [`SchedulerError::Content`] if
    /// the deletion cannot be completed.
    #[instrument(skip(self))]
    pub async fn remove_resource(&self, resource_id: &str) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().await;
            for task in inner.tasks.list_for_resource(resource_id).await? {
                if task.status.is_terminal() {
                    inner.notify_waiters(&mut state, &task.id, &TaskOutcome::Removed);
                } else {
                    inner.cancel_locked(&mut state, &task.id).await?;
                }
            }
            inner.tasks.remove_for_resource(resource_id).await?;
            state.removing.insert(resource_id.to_string());
        }

        let deleted = inner.content.delete_all(resource_id).await;
        inner.state.lock().await.removing.remove(resource_id);
        self.tick();
        Ok(deleted?)
    }

    /// Restarts the failed tasks of a resource with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Store`] if the task store cannot be updated.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, resource_id: &str) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let mut restarted = 0;
        {
            let _state = inner.state.lock().await;
            for task in inner.tasks.list_for_resource(resource_id).await? {
                if task.status != TaskStatus::Failed {
                    continue;
                }
                inner
                    .tasks
                    .reset(&task.id, task.destination_tier, task.priority)
                    .await?;
                inner.emit_transition(&task, TaskStatus::Queued, None, None);
                restarted += 1;
            }
        }
        inner.refresh_record(resource_id).await;
        self.tick();
        Ok(restarted)
    }

    /// Evicts the oldest cached payloads above the configured ephemeral budget.
    ///
    /// Completed cache-only tasks whose payload was evicted are forgotten.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Content`] if eviction fails.
    pub async fn trim_cache(&self) -> Result<Vec<TaskId>, SchedulerError> {
        let Some(limit) = self.inner.config.ephemeral_cache_limit_bytes else {
            return Ok(Vec::new());
        };
        self.inner.trim_cache(limit).await
    }

    /// Recomputes and publishes a resource's aggregate.
    pub async fn refresh_record(&self, resource_id: &str) {
        self.inner.refresh_record(resource_id).await;
    }

    /// Stops admission, pauses running transfers (keeping resume data) and
    /// waits for the loop to exit.
    ///
    /// Interrupted tasks are left queued so the next start picks them up.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShutDown`] if the loop had already exited.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;
            state.stopping = true;
            for active in state.active.values_mut() {
                if active.intent.is_none() {
                    active.intent = Some(StopIntent::Shutdown);
                    active.stop.request(StopReason::Pause);
                }
            }
            info!(active = state.active.len(), "scheduler shutting down");
        }
        let (reply, done) = oneshot::channel();
        self.inner
            .tx
            .send(SchedulerMsg::Shutdown(reply))
            .map_err(|_| SchedulerError::ShutDown)?;
        done.await.map_err(|_| SchedulerError::ShutDown)
    }
}

async fn run_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<SchedulerMsg>) {
    let mut network = inner.network.subscribe();
    let mut network_open = true;
    let mut can_transfer = network.borrow_and_update().can_transfer();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if inner.handle(msg).await == Flow::Exit {
                    break;
                }
            }
            changed = network.changed(), if network_open => {
                if changed.is_err() {
                    network_open = false;
                    continue;
                }
                let now = network.borrow_and_update().can_transfer();
                if now != can_transfer {
                    can_transfer = now;
                    inner.on_network_change(now).await;
                }
            }
        }
    }
    debug!("scheduler loop exited");
}

impl Inner {
    async fn handle(&self, msg: SchedulerMsg) -> Flow {
        match msg {
            SchedulerMsg::Tick => {
                self.admit().await;
                Flow::Continue
            }
            SchedulerMsg::Progress {
                id,
                attempt,
                progress,
            } => {
                self.on_progress(&id, attempt, progress).await;
                Flow::Continue
            }
            SchedulerMsg::Finished {
                id,
                attempt,
                outcome,
            } => {
                self.on_finished(id, attempt, outcome).await;
                if self.finish_shutdown_if_idle().await {
                    return Flow::Exit;
                }
                self.admit().await;
                Flow::Continue
            }
            SchedulerMsg::Shutdown(reply) => {
                self.state.lock().await.shutdown_reply = Some(reply);
                if self.finish_shutdown_if_idle().await {
                    Flow::Exit
                } else {
                    Flow::Continue
                }
            }
        }
    }

    async fn finish_shutdown_if_idle(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.stopping || !state.active.is_empty() {
            return false;
        }
        let Some(reply) = state.shutdown_reply.take() else {
            return false;
        };
        for (_, waiters) in state.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(TaskOutcome::Interrupted);
            }
        }
        let _ = reply.send(());
        true
    }

    /// Admits queued tasks up to the concurrency cap.
    async fn admit(&self) {
        let mut touched = BTreeSet::new();
        {
            let mut state = self.state.lock().await;
            if !state.started || state.stopping {
                return;
            }
            if !self.network.can_transfer_now() {
                debug!("network policy forbids transfers; admission skipped");
                return;
            }

            let now = now_millis();
            if state.wakeup_at.is_some_and(|at| at <= now) {
                state.wakeup_at = None;
            }

            let free = self
                .config
                .max_concurrent_transfers
                .saturating_sub(state.active.len());
            if free > 0 {
                let candidates = match self.tasks.list_admissible(now, free).await {
                    Ok(candidates) => candidates,
                    Err(err) => {
                        warn!(error = %err, "failed to list admissible tasks");
                        Vec::new()
                    }
                };
                for task in candidates {
                    if state.active.contains_key(&task.id)
                        || state.removing.contains(&task.id.resource_id)
                    {
                        continue;
                    }
                    if let Err(err) = self.tasks.mark_downloading(&task.id).await {
                        warn!(task = %task.id, error = %err, "failed to admit task");
                        continue;
                    }
                    info!(task = %task.id, priority = %task.priority, retry_count = task.retry_count, "task admitted");
                    self.emit_transition(&task, TaskStatus::Downloading, None, None);
                    touched.insert(task.id.resource_id.clone());
                    let id = task.id.clone();
                    let active = self.spawn_attempt(task);
                    state.active.insert(id, active);
                }
            }

            self.schedule_wakeup(&mut state, now).await;
        }
        for resource_id in touched {
            self.refresh_record(&resource_id).await;
        }
    }

    fn spawn_attempt(&self, task: TransferTask) -> ActiveTransfer {
        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        let (stop, listener) = StopHandle::new();

        let progress_tx = self.tx.clone();
        let progress_id = task.id.clone();
        let sink: ProgressSink = Arc::new(move |progress| {
            let _ = progress_tx.send(SchedulerMsg::Progress {
                id: progress_id.clone(),
                attempt,
                progress,
            });
        });

        let ctx = job::JobContext {
            api: Arc::clone(&self.api),
            tasks: self.tasks.clone(),
            executor: self.executor.clone(),
        };
        let tx = self.tx.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            let outcome = job::run_attempt(ctx, task, listener, sink).await;
            let _ = tx.send(SchedulerMsg::Finished {
                id,
                attempt,
                outcome,
            });
        });

        ActiveTransfer {
            attempt,
            stop,
            intent: None,
        }
    }

    /// Arms a single timer for the earliest future backoff deadline.
    async fn schedule_wakeup(&self, state: &mut SchedulerState, now: i64) {
        let deadline = match self.tasks.next_backoff_deadline().await {
            Ok(Some(deadline)) if deadline > now => deadline,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "failed to read backoff deadline");
                return;
            }
        };
        if state.wakeup_at.is_some_and(|at| at <= deadline) {
            return;
        }
        state.wakeup_at = Some(deadline);

        let delay = Duration::from_millis(u64::try_from(deadline - now).unwrap_or(0));
        debug!(delay_ms = delay.as_millis(), "backoff wake-up scheduled");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SchedulerMsg::Tick);
        });
    }

    async fn on_progress(&self, id: &TaskId, attempt: u64, progress: TransferProgress) {
        {
            let state = self.state.lock().await;
            let current = state
                .active
                .get(id)
                .is_some_and(|active| active.attempt == attempt && active.intent.is_none());
            if !current {
                return;
            }
            if let Err(err) = self
                .tasks
                .update_progress(id, progress.bytes_transferred, progress.bytes_total)
                .await
            {
                debug!(task = %id, error = %err, "failed to persist progress");
                return;
            }
        }
        self.events.emit(TransferEvent::TaskProgress {
            id: id.clone(),
            bytes_transferred: progress.bytes_transferred,
            bytes_total: progress.bytes_total,
        });
        self.refresh_record(&id.resource_id).await;
    }

    async fn on_finished(&self, id: TaskId, attempt: u64, outcome: TransferOutcome) {
        let staged = {
            let mut state = self.state.lock().await;
            let intent = match state.active.get(&id) {
                Some(active) if active.attempt == attempt => active.intent,
                _ => {
                    warn!(task = %id, attempt, "result for unknown attempt ignored");
                    return;
                }
            };
            // A finished download stays active until its file is committed.
            let committing = intent != Some(StopIntent::Cancel)
                && matches!(outcome, TransferOutcome::Completed { .. });
            if !committing {
                state.active.remove(&id);
            }

            match (intent, outcome) {
                (Some(StopIntent::Cancel), _) => {
                    debug!(task = %id, "cancelled transfer settled");
                    self.release_staging(&id).await;
                    None
                }
                (_, TransferOutcome::Completed { staged_path, bytes }) => {
                    Some((staged_path, bytes))
                }
                (
                    Some(StopIntent::Pause(_)),
                    TransferOutcome::Stopped {
                        resume_token,
                        bytes,
                        ..
                    }
                    | TransferOutcome::Failed {
                        resume_token,
                        bytes,
                        ..
                    },
                ) => {
                    self.persist_resume(&id, resume_token.as_ref(), bytes).await;
                    None
                }
                (
                    Some(StopIntent::Shutdown),
                    TransferOutcome::Stopped {
                        resume_token,
                        bytes,
                        ..
                    }
                    | TransferOutcome::Failed {
                        resume_token,
                        bytes,
                        ..
                    },
                ) => {
                    self.persist_resume(&id, resume_token.as_ref(), bytes).await;
                    self.requeue_interrupted(&id).await;
                    None
                }
                (
                    None,
                    TransferOutcome::Stopped {
                        resume_token,
                        bytes,
                        ..
                    },
                ) => {
                    self.persist_resume(&id, resume_token.as_ref(), bytes).await;
                    if let Err(err) = self.tasks.mark_paused(&id, PauseReason::User).await {
                        warn!(task = %id, error = %err, "failed to mark task paused");
                    }
                    None
                }
                (
                    None,
                    TransferOutcome::Failed {
                        error,
                        resume_token,
                        bytes,
                    },
                ) => {
                    self.fail_or_retry(&mut state, &id, &error, resume_token, bytes)
                        .await;
                    None
                }
            }
        };
        if let Some((staged_path, bytes)) = staged {
            self.complete(&id, &staged_path, bytes).await;
        }
        self.refresh_record(&id.resource_id).await;
    }

    async fn requeue_interrupted(&self, id: &TaskId) {
        if let Err(err) = self.tasks.requeue(id).await {
            warn!(task = %id, error = %err, "failed to requeue interrupted task");
            return;
        }
        match self.tasks.get(id).await {
            Ok(Some(task)) => self.emit_transition(&task, TaskStatus::Queued, None, None),
            Ok(None) => {}
            Err(err) => debug!(task = %id, error = %err, "failed to reload requeued task"),
        }
    }

    /// Commits a verified staging file into the task's destination tier.
    ///
    /// The file moves outside the lock while the attempt is still registered
    /// as active. A cancel that arrives meanwhile is honoured afterwards by
    /// deleting the committed file.
    async fn complete(&self, id: &TaskId, staged: &Path, bytes: u64) {
        let tier = match self.tasks.get(id).await {
            Ok(Some(task)) => task.destination_tier,
            Ok(None) => {
                self.state.lock().await.active.remove(id);
                self.release_staging(id).await;
                return;
            }
            Err(err) => {
                warn!(task = %id, error = %err, "failed to load completed task");
                self.state.lock().await.active.remove(id);
                return;
            }
        };
        let committed = self.content.commit(tier, id, staged).await;

        let mut state = self.state.lock().await;
        let intent = state.active.remove(id).and_then(|active| active.intent);
        let task = match self.tasks.get(id).await {
            Ok(Some(task)) if intent != Some(StopIntent::Cancel) => task,
            Ok(_) => {
                debug!(task = %id, "transfer cancelled while committing");
                if committed.is_ok()
                    && let Err(err) = self.content.delete(tier, id).await
                {
                    warn!(task = %id, error = %err, "failed to delete cancelled payload");
                }
                self.release_staging(id).await;
                return;
            }
            Err(err) => {
                warn!(task = %id, error = %err, "failed to load completed task");
                return;
            }
        };

        let path = match committed {
            // Upgraded to persistent while the file was moving.
            Ok(_) if task.destination_tier != tier => self.content.promote(id).await,
            other => other,
        };
        let tier = task.destination_tier;
        match path {
            Ok(path) => {
                if let Err(err) = self.tasks.mark_completed(id, bytes).await {
                    warn!(task = %id, error = %err, "failed to mark task completed");
                }
                self.release_staging(id).await;
                info!(task = %id, %tier, bytes, "task completed");
                self.emit_transition(&task, TaskStatus::Completed, None, None);
                self.notify_waiters(&mut state, id, &TaskOutcome::Completed { path });
            }
            Err(err) => {
                let error = TransferError::from(err);
                self.fail_or_retry(&mut state, id, &error, None, 0).await;
                return;
            }
        }
        drop(state);

        if tier == Tier::Ephemeral
            && let Some(limit) = self.config.ephemeral_cache_limit_bytes
            && let Err(err) = self.trim_cache(limit).await
        {
            warn!(error = %err, "failed to trim ephemeral tier");
        }
    }

    /// Applies the retry policy to a failed attempt.
    async fn fail_or_retry(
        &self,
        state: &mut SchedulerState,
        id: &TaskId,
        error: &TransferError,
        resume_token: Option<ResumeToken>,
        bytes: u64,
    ) {
        let task = match self.tasks.get(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.release_staging(id).await;
                return;
            }
            Err(err) => {
                warn!(task = %id, error = %err, "failed to load failed task");
                return;
            }
        };

        let failure = classify_error(error);
        let message = error.to_string();
        match self
            .config
            .retry_policy
            .should_retry(failure, task.retry_count, task.max_retries)
        {
            RetryDecision::Retry { delay, retry_count } => {
                let delay = server_retry_delay(error).unwrap_or(delay);
                let now = now_millis();
                let resumable = resume_token.is_some();
                let update = RetryUpdate {
                    retry_count,
                    not_before: now.saturating_add(duration_millis(delay)),
                    last_error: message.clone(),
                    failure,
                    needs_resolve: failure == FailureType::ExpiredSource
                        || matches!(error, TransferError::Resolve { .. }),
                    resume_token,
                    bytes_transferred: if resumable { bytes } else { 0 },
                };
                if let Err(err) = self.tasks.requeue_for_retry(id, &update).await {
                    warn!(task = %id, error = %err, "failed to requeue task for retry");
                    return;
                }
                info!(
                    task = %id,
                    retry_count,
                    max_retries = task.max_retries,
                    delay_ms = delay.as_millis(),
                    failure = %failure,
                    resumable,
                    error = %message,
                    "transfer will be retried"
                );
                self.emit_status(
                    &TransferTask {
                        status: TaskStatus::Queued,
                        retry_count,
                        pause_reason: None,
                        ..task
                    },
                    Some(message),
                );
                self.schedule_wakeup(state, now).await;
            }
            RetryDecision::DoNotRetry {
                reason,
                retry_count,
            } => {
                if let Err(err) = self
                    .tasks
                    .mark_failed(id, retry_count, &message, failure)
                    .await
                {
                    warn!(task = %id, error = %err, "failed to mark task failed");
                }
                self.release_staging(id).await;
                warn!(task = %id, %reason, failure = %failure, error = %message, "transfer failed");
                self.emit_status(
                    &TransferTask {
                        status: TaskStatus::Failed,
                        retry_count,
                        pause_reason: None,
                        ..task
                    },
                    Some(message.clone()),
                );
                self.refresh_record(&id.resource_id).await;
                self.notify_waiters(
                    state,
                    id,
                    &TaskOutcome::Failed {
                        error: message,
                        failure,
                    },
                );
            }
        }
    }

    /// Pauses running transfers when the policy closes; re-queues
    /// network-paused tasks when it opens.
    async fn on_network_change(&self, can_transfer: bool) {
        let mut touched = BTreeSet::new();
        {
            let mut state = self.state.lock().await;
            if can_transfer {
                info!("network available; re-admitting network-paused tasks");
                match self.tasks.list_by_status(TaskStatus::Paused).await {
                    Ok(paused) => {
                        for task in paused
                            .iter()
                            .filter(|task| task.pause_reason == Some(PauseReason::Network))
                        {
                            if let Err(err) = self.tasks.requeue(&task.id).await {
                                warn!(task = %task.id, error = %err, "failed to requeue task");
                                continue;
                            }
                            self.emit_transition(task, TaskStatus::Queued, None, None);
                            touched.insert(task.id.resource_id.clone());
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to list paused tasks"),
                }
            } else {
                info!(active = state.active.len(), "network lost; pausing active transfers");
                let ids: Vec<TaskId> = state
                    .active
                    .iter()
                    .filter(|(_, active)| active.intent.is_none())
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    if let Some(active) = state.active.get_mut(&id) {
                        active.intent = Some(StopIntent::Pause(PauseReason::Network));
                        active.stop.request(StopReason::Pause);
                    }
                    if let Err(err) = self.tasks.mark_paused(&id, PauseReason::Network).await {
                        warn!(task = %id, error = %err, "failed to mark task paused");
                        continue;
                    }
                    match self.tasks.get(&id).await {
                        Ok(Some(task)) => self.emit_status(&task, None),
                        Ok(None) => {}
                        Err(err) => debug!(task = %id, error = %err, "failed to reload paused task"),
                    }
                    touched.insert(id.resource_id.clone());
                }
            }
        }
        for resource_id in touched {
            self.refresh_record(&resource_id).await;
        }
        if can_transfer {
            self.admit().await;
        }
    }

    /// Completed payload path for a repeat request, promoting a cached copy
    /// when the request wants it kept. `None` when the payload is gone.
    async fn settle_completed(
        &self,
        task: &TransferTask,
        request: &EnqueueRequest,
    ) -> Result<Option<PathBuf>, SchedulerError> {
        let Some(tier) = self.content.tier_of(&task.id).await else {
            return Ok(None);
        };
        if request.tier == Tier::Persistent && tier == Tier::Ephemeral {
            return match self.content.promote(&task.id).await {
                Ok(path) => {
                    self.tasks
                        .update_destination(
                            &task.id,
                            Tier::Persistent,
                            task.priority.max(request.priority),
                        )
                        .await?;
                    info!(task = %task.id, "promoted cached payload to persistent tier");
                    Ok(Some(path))
                }
                Err(ContentError::MissingEphemeral(_)) => Ok(None),
                Err(err) => Err(err.into()),
            };
        }
        Ok(Some(self.content.path_for(tier, &task.id)))
    }

    async fn restart(
        &self,
        task: &TransferTask,
        request: &EnqueueRequest,
    ) -> Result<(), SchedulerError> {
        self.tasks
            .reset(
                &task.id,
                task.destination_tier.max(request.tier),
                task.priority.max(request.priority),
            )
            .await?;
        self.emit_transition(task, TaskStatus::Queued, None, None);
        Ok(())
    }

    /// Stops (if running) and deletes a live task. Caller holds the lock.
    async fn cancel_locked(
        &self,
        state: &mut SchedulerState,
        id: &TaskId,
    ) -> Result<(), SchedulerError> {
        if let Some(active) = state.active.get_mut(id) {
            active.intent = Some(StopIntent::Cancel);
            active.stop.request(StopReason::Discard);
        } else {
            self.release_staging(id).await;
        }
        match self.tasks.remove(id).await {
            Ok(()) | Err(StoreError::TaskNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        info!(task = %id, "task cancelled");
        self.events.emit(TransferEvent::TaskStatusChanged {
            id: id.clone(),
            status: None,
            pause_reason: None,
            retry_count: 0,
            error: None,
        });
        self.notify_waiters(state, id, &TaskOutcome::Removed);
        Ok(())
    }

    /// Evicts cached files outside the lock, then forgets the completed
    /// cache-only tasks that owned them.
    async fn trim_cache(&self, limit: u64) -> Result<Vec<TaskId>, SchedulerError> {
        let evicted = self.content.trim_ephemeral(limit).await?;
        if evicted.is_empty() {
            return Ok(evicted);
        }
        let state = self.state.lock().await;
        for id in &evicted {
            if state.active.contains_key(id) {
                continue;
            }
            match self.tasks.get(id).await? {
                Some(task)
                    if task.status == TaskStatus::Completed
                        && task.destination_tier == Tier::Ephemeral =>
                {
                    self.tasks.remove(id).await?;
                    debug!(task = %id, "forgot evicted cache task");
                }
                _ => {}
            }
        }
        Ok(evicted)
    }

    async fn persist_resume(&self, id: &TaskId, token: Option<&ResumeToken>, bytes: u64) {
        let bytes = if token.is_some() { bytes } else { 0 };
        match self.tasks.store_resume_token(id, token, bytes).await {
            Ok(()) => debug!(task = %id, bytes, resumable = token.is_some(), "resume state saved"),
            Err(StoreError::TaskNotFound(_)) => self.release_staging(id).await,
            Err(err) => warn!(task = %id, error = %err, "failed to save resume state"),
        }
    }

    async fn release_staging(&self, id: &TaskId) {
        if let Err(err) = self.executor.release(id).await {
            warn!(task = %id, error = %err, "failed to release staging files");
        }
    }

    fn notify_waiters(&self, state: &mut SchedulerState, id: &TaskId, outcome: &TaskOutcome) {
        if let Some(waiters) = state.waiters.remove(id) {
            debug!(task = %id, waiters = waiters.len(), "notifying waiters");
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    fn emit_transition(
        &self,
        task: &TransferTask,
        status: TaskStatus,
        pause_reason: Option<PauseReason>,
        error: Option<String>,
    ) {
        self.events.emit(TransferEvent::TaskStatusChanged {
            id: task.id.clone(),
            status: Some(status),
            pause_reason,
            retry_count: task.retry_count,
            error,
        });
    }

    fn emit_status(&self, task: &TransferTask, error: Option<String>) {
        self.emit_transition(task, task.status, task.pause_reason, error);
    }

    /// Recomputes a resource's record from its tasks and publishes it.
    ///
    /// Resources without a record (cache-only prefetches) are skipped.
    async fn refresh_record(&self, resource_id: &str) {
        let tasks = match self.tasks.list_for_resource(resource_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(resource_id, error = %err, "failed to load tasks for record");
                return;
            }
        };
        let aggregate = RecordAggregate::from_tasks(&tasks);
        match self.records.save_aggregate(resource_id, &aggregate).await {
            Ok(()) => self.events.emit(TransferEvent::ResourceChanged {
                resource_id: resource_id.to_string(),
                status: aggregate.status,
                completed_units: aggregate.completed_units,
                total_units: aggregate.total_units,
                fraction: aggregate.fraction(),
            }),
            Err(StoreError::RecordNotFound(_)) => {}
            Err(err) => warn!(resource_id, error = %err, "failed to save record aggregate"),
        }
    }
}
