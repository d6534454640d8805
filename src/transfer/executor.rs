//! Resumable single-task transfers.
//!
//! A transfer streams its source into `<staging>/<key>.part` and keeps a
//! [`SessionJournal`] beside it. On success the part file is fully written,
//! synced and length-checked before [`TransferOutcome::Completed`] is
//! returned; committing it into a storage tier is the caller's job.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::client::{
    HttpTransport, RangeRequest, accepts_ranges, content_length, content_range, validator_of,
};
use super::progress::{ProgressThrottle, TransferProgress};
use super::resume::{ResumeState, ResumeToken};
use super::retry::{FailureType, classify_error};
use super::session::{SessionJournal, SessionState, StagingPaths, is_part_file, is_session_file};
use super::TransferError;
use crate::store::TaskId;

/// Why a running transfer is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep partial bytes and produce a resume token when possible.
    Pause,
    /// Throw away everything staged for the task.
    Discard,
}

/// Receiving side of a stop request.
pub type StopListener = watch::Receiver<Option<StopReason>>;

/// Callback receiving throttled progress.
pub type ProgressSink = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Sending side of a stop request.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl StopHandle {
    #[must_use]
    pub fn new() -> (Self, StopListener) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Asks the transfer to stop. The first request wins.
    pub fn request(&self, reason: StopReason) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

/// What to transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: TaskId,
    pub url: String,
    /// Token from a previous stop; `None` starts from byte zero.
    pub resume: Option<ResumeToken>,
}

/// Terminal result of one transfer run.
#[derive(Debug)]
pub enum TransferOutcome {
    /// Staged file is complete, synced and verified.
    Completed { staged_path: PathBuf, bytes: u64 },
    /// Stopped on request.
    Stopped {
        reason: StopReason,
        resume_token: Option<ResumeToken>,
        bytes: u64,
    },
    /// Failed; a token is kept when the partial bytes are still usable.
    Failed {
        error: TransferError,
        resume_token: Option<ResumeToken>,
        bytes: u64,
    },
}

/// A running transfer started with [`TransferExecutor::start`].
#[derive(Debug)]
pub struct TransferHandle {
    id: TaskId,
    stop: StopHandle,
    join: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Waits for the transfer to finish on its own.
    pub async fn wait(self) -> TransferOutcome {
        let id = self.id;
        join_outcome(&id, self.join).await
    }

    /// Requests a stop and waits for the transfer to settle.
    pub async fn stop(self, reason: StopReason) -> TransferOutcome {
        self.stop.request(reason);
        self.wait().await
    }
}

async fn join_outcome(id: &TaskId, join: JoinHandle<TransferOutcome>) -> TransferOutcome {
    match join.await {
        Ok(outcome) => outcome,
        Err(err) => TransferOutcome::Failed {
            error: TransferError::io(id.storage_key(), io::Error::other(err)),
            resume_token: None,
            bytes: 0,
        },
    }
}

/// Whether a recovered staging file is ready to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveredState {
    Complete,
    Partial,
}

/// A transfer found in the staging area at startup.
#[derive(Debug, Clone)]
pub struct RecoveredSession {
    pub id: TaskId,
    pub state: RecoveredState,
    pub staged_path: PathBuf,
    pub bytes: u64,
    /// Continuation for partial sessions, when the server allowed ranges.
    pub resume_token: Option<ResumeToken>,
}

/// Mutable state of a single run, updated as the response arrives.
#[derive(Debug)]
struct Attempt {
    paths: StagingPaths,
    url: String,
    validator: Option<String>,
    accepts_ranges: bool,
    total: Option<u64>,
    bytes: u64,
}

enum Finish {
    Completed,
    Stopped(StopReason),
}

/// Performs transfers into the staging directory.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    transport: HttpTransport,
    staging_dir: PathBuf,
    progress_interval: Duration,
}

impl TransferExecutor {
    #[must_use]
    pub fn new(
        transport: HttpTransport,
        staging_dir: impl Into<PathBuf>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            transport,
            staging_dir: staging_dir.into(),
            progress_interval,
        }
    }

    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    #[must_use]
    pub fn staging_paths(&self, id: &TaskId) -> StagingPaths {
        StagingPaths::new(&self.staging_dir, id)
    }

    /// Spawns a transfer and returns its handle.
    #[must_use]
    pub fn start(&self, request: TransferRequest, sink: ProgressSink) -> TransferHandle {
        let (stop, listener) = StopHandle::new();
        let id = request.id.clone();
        let executor = self.clone();
        let join = tokio::spawn(async move { executor.run(request, listener, sink).await });
        TransferHandle { id, stop, join }
    }

    /// Continues a paused transfer from its resume token.
    ///
    /// Without a usable token (or when the source changed) the transfer
    /// restarts from byte zero.
    #[must_use]
    pub fn resume(&self, request: TransferRequest, sink: ProgressSink) -> TransferHandle {
        if request.resume.is_none() {
            debug!(task = %request.id, "resume without token; restarting from zero");
        }
        self.start(request, sink)
    }

    /// Stops a transfer, keeping resumable state. Returns the token, if any.
    pub async fn pause(&self, handle: TransferHandle) -> Option<ResumeToken> {
        match handle.stop(StopReason::Pause).await {
            TransferOutcome::Stopped { resume_token, .. }
            | TransferOutcome::Failed { resume_token, .. } => resume_token,
            TransferOutcome::Completed { .. } => None,
        }
    }

    /// Runs a transfer to its end on the current task.
    #[instrument(skip(self, request, stop, sink), fields(task = %request.id, resuming = request.resume.is_some()))]
    pub async fn run(
        &self,
        request: TransferRequest,
        mut stop: StopListener,
        sink: ProgressSink,
    ) -> TransferOutcome {
        let mut attempt = Attempt {
            paths: self.staging_paths(&request.id),
            url: request.url.clone(),
            validator: None,
            accepts_ranges: false,
            total: None,
            bytes: 0,
        };

        match self.transfer(&request, &mut attempt, &mut stop, &sink).await {
            Ok(Finish::Completed) => {
                info!(bytes = attempt.bytes, "transfer complete");
                TransferOutcome::Completed {
                    staged_path: attempt.paths.part.clone(),
                    bytes: attempt.bytes,
                }
            }
            Ok(Finish::Stopped(reason)) => settle_stopped(reason, &attempt).await,
            Err(error) => settle_failed(error, &attempt).await,
        }
    }

    async fn transfer(
        &self,
        request: &TransferRequest,
        attempt: &mut Attempt,
        stop: &mut StopListener,
        sink: &ProgressSink,
    ) -> Result<Finish, TransferError> {
        if let Some(reason) = *stop.borrow() {
            return Ok(Finish::Stopped(reason));
        }
        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| TransferError::io(&self.staging_dir, e))?;

        let resume = usable_resume_state(request.resume.as_ref(), &attempt.paths.part).await?;
        match &resume {
            Some(state) => {
                attempt.bytes = state.bytes;
                attempt.validator = Some(state.validator.clone());
                attempt.accepts_ranges = true;
                attempt.total = state.total;
            }
            None => attempt.paths.discard().await?,
        }

        let range = resume.as_ref().map(|state| RangeRequest {
            offset: state.bytes,
            validator: &state.validator,
        });
        let response = tokio::select! {
            biased;
            reason = stop_requested(stop) => return Ok(Finish::Stopped(reason)),
            response = self.transport.get(&request.url, range) => response?,
        };
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            if let Some(state) = &resume
                && state.total == Some(state.bytes)
            {
                debug!("staged bytes already cover the whole source");
                self.mark_complete(&request.id, attempt).await?;
                return Ok(Finish::Completed);
            }
            attempt.paths.discard().await?;
            attempt.bytes = 0;
            attempt.accepts_ranges = false;
            return Err(TransferError::http_status(&request.url, status.as_u16()));
        }

        let file = if status == StatusCode::PARTIAL_CONTENT
            && let Some(state) = &resume
        {
            let (start, declared_total) =
                content_range(&response).unwrap_or((state.bytes, None));
            if start != state.bytes {
                attempt.paths.discard().await?;
                attempt.bytes = 0;
                attempt.accepts_ranges = false;
                return Err(TransferError::integrity(
                    &attempt.paths.part,
                    state.bytes,
                    start,
                ));
            }
            attempt.total = declared_total
                .or_else(|| content_length(&response).map(|len| len.saturating_add(start)))
                .or(state.total);
            if let Some(validator) = validator_of(&response) {
                attempt.validator = Some(validator);
            }
            debug!(offset = start, "resuming staged transfer");
            fs::OpenOptions::new()
                .append(true)
                .open(&attempt.paths.part)
                .await
                .map_err(|e| TransferError::io(&attempt.paths.part, e))?
        } else {
            if resume.is_some() {
                debug!(status = status.as_u16(), "source did not honour range; restarting from zero");
            }
            attempt.bytes = 0;
            attempt.total = content_length(&response);
            attempt.validator = validator_of(&response);
            attempt.accepts_ranges = accepts_ranges(&response);
            fs::File::create(&attempt.paths.part)
                .await
                .map_err(|e| TransferError::io(&attempt.paths.part, e))?
        };

        SessionJournal::new(
            &request.id,
            &request.url,
            attempt.validator.clone(),
            attempt.total,
            attempt.accepts_ranges,
        )
        .save(&attempt.paths.session)
        .await?;

        let mut throttle = ProgressThrottle::new(self.progress_interval);
        throttle.should_emit(Instant::now());
        sink(progress_of(attempt));

        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                reason = stop_requested(stop) => {
                    let _ = writer.flush().await;
                    let _ = writer.get_ref().sync_all().await;
                    return Ok(Finish::Stopped(reason));
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        writer
                            .write_all(&bytes)
                            .await
                            .map_err(|e| TransferError::io(&attempt.paths.part, e))?;
                        attempt.bytes = attempt.bytes.saturating_add(bytes.len() as u64);
                        if throttle.should_emit(Instant::now()) {
                            sink(progress_of(attempt));
                        }
                    }
                    Some(Err(err)) => {
                        let _ = writer.flush().await;
                        return Err(TransferError::network(&request.url, err));
                    }
                    None => break,
                },
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| TransferError::io(&attempt.paths.part, e))?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| TransferError::io(&attempt.paths.part, e))?;
        if throttle.take_pending() {
            sink(progress_of(attempt));
        }

        if let Some(total) = attempt.total
            && total != attempt.bytes
        {
            let actual = attempt.bytes;
            attempt.paths.discard().await?;
            attempt.bytes = 0;
            attempt.accepts_ranges = false;
            return Err(TransferError::integrity(&attempt.paths.part, total, actual));
        }

        self.mark_complete(&request.id, attempt).await?;
        Ok(Finish::Completed)
    }

    async fn mark_complete(&self, id: &TaskId, attempt: &Attempt) -> Result<(), TransferError> {
        let mut journal = SessionJournal::new(
            id,
            &attempt.url,
            attempt.validator.clone(),
            attempt.total.or(Some(attempt.bytes)),
            attempt.accepts_ranges,
        );
        journal.state = SessionState::Complete;
        journal.save(&attempt.paths.session).await
    }

    /// Stages an inline payload as a complete session, ready to commit.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the staging file cannot be written.
    #[instrument(skip(self, bytes), fields(task = %id, len = bytes.len()))]
    pub async fn stage_inline(&self, id: &TaskId, bytes: &[u8]) -> Result<PathBuf, TransferError> {
        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| TransferError::io(&self.staging_dir, e))?;
        let paths = self.staging_paths(id);
        let mut file = fs::File::create(&paths.part)
            .await
            .map_err(|e| TransferError::io(&paths.part, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| TransferError::io(&paths.part, e))?;
        file.sync_all()
            .await
            .map_err(|e| TransferError::io(&paths.part, e))?;

        let attempt = Attempt {
            paths: paths.clone(),
            url: "inline:".to_string(),
            validator: None,
            accepts_ranges: false,
            total: Some(bytes.len() as u64),
            bytes: bytes.len() as u64,
        };
        self.mark_complete(id, &attempt).await?;
        Ok(paths.part)
    }

    /// Drops everything staged for a task.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if a staging file cannot be removed.
    pub async fn release(&self, id: &TaskId) -> Result<(), TransferError> {
        self.staging_paths(id).discard().await
    }

    /// Enumerates transfers left in the staging area by a previous process.
    ///
    /// Unreadable journals and part files without a journal are deleted.
    /// Call before any transfer is started.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the staging directory cannot be read.
    #[instrument(skip(self), fields(dir = %self.staging_dir.display()))]
    pub async fn recover_sessions(&self) -> Result<Vec<RecoveredSession>, TransferError> {
        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| TransferError::io(&self.staging_dir, e))?;

        let files = list_dir(&self.staging_dir).await?;
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut sessions = Vec::new();

        for path in files.iter().filter(|p| is_session_file(p)) {
            let Some(journal) = SessionJournal::load(path).await? else {
                warn!(path = %path.display(), "discarding unreadable session journal");
                remove_quietly(path).await;
                continue;
            };
            let paths = self.staging_paths(&journal.task);
            if &paths.session != path {
                warn!(path = %path.display(), "journal does not match its file name; discarding");
                remove_quietly(path).await;
                continue;
            }

            let staged = fs::metadata(&paths.part).await.ok().map(|m| m.len());
            claimed.insert(paths.part.clone());
            let bytes = staged.unwrap_or(0);

            let complete = journal.state == SessionState::Complete
                && staged.is_some()
                && journal.total.is_none_or(|total| total == bytes);
            let (state, resume_token) = if complete {
                (RecoveredState::Complete, None)
            } else {
                let token = journal.validator.as_deref().and_then(|validator| {
                    ResumeState::capture(
                        &journal.url,
                        bytes,
                        Some(validator),
                        journal.accepts_ranges,
                        journal.total,
                    )
                });
                (RecoveredState::Partial, token)
            };

            debug!(task = %journal.task, ?state, bytes, "recovered session");
            sessions.push(RecoveredSession {
                id: journal.task,
                state,
                staged_path: paths.part,
                bytes,
                resume_token,
            });
        }

        for path in &files {
            let orphan_part = is_part_file(path) && !claimed.contains(path);
            let temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".tmp"));
            if orphan_part || temp {
                debug!(path = %path.display(), "removing orphan staging file");
                remove_quietly(path).await;
            }
        }

        info!(sessions = sessions.len(), "staging area scanned");
        Ok(sessions)
    }
}

fn progress_of(attempt: &Attempt) -> TransferProgress {
    TransferProgress {
        bytes_transferred: attempt.bytes,
        bytes_total: attempt.total,
    }
}

async fn stop_requested(stop: &mut StopListener) -> StopReason {
    // Copy the value out so no `watch::Ref` is held across an await.
    let seen = stop.wait_for(Option::is_some).await.map(|reason| *reason);
    match seen {
        Ok(reason) => reason.unwrap_or(StopReason::Pause),
        // Nobody can ask us to stop any more; run to completion.
        Err(_) => std::future::pending().await,
    }
}

/// Decodes a token and checks the staged file still backs it.
///
/// A longer file is truncated back to the token's offset; a shorter one
/// means the token is stale.
async fn usable_resume_state(
    token: Option<&ResumeToken>,
    part: &Path,
) -> Result<Option<ResumeState>, TransferError> {
    let Some(state) = token.and_then(ResumeToken::decode) else {
        return Ok(None);
    };
    let staged = match fs::metadata(part).await {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(None),
    };
    if staged < state.bytes {
        debug!(staged, expected = state.bytes, "staged file shorter than token");
        return Ok(None);
    }
    if staged > state.bytes {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(part)
            .await
            .map_err(|e| TransferError::io(part, e))?;
        file.set_len(state.bytes)
            .await
            .map_err(|e| TransferError::io(part, e))?;
    }
    Ok(Some(state))
}

async fn staged_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn settle_stopped(reason: StopReason, attempt: &Attempt) -> TransferOutcome {
    if reason == StopReason::Discard {
        if let Err(err) = attempt.paths.discard().await {
            warn!(error = %err, "failed to discard staging files");
        }
        return TransferOutcome::Stopped {
            reason,
            resume_token: None,
            bytes: 0,
        };
    }

    let bytes = staged_len(&attempt.paths.part).await;
    let resume_token = ResumeState::capture(
        &attempt.url,
        bytes,
        attempt.validator.as_deref(),
        attempt.accepts_ranges,
        attempt.total,
    );
    if resume_token.is_none() {
        debug!("no resumable state; discarding partial bytes");
        if let Err(err) = attempt.paths.discard().await {
            warn!(error = %err, "failed to discard staging files");
        }
    }
    info!(bytes, resumable = resume_token.is_some(), "transfer paused");
    TransferOutcome::Stopped {
        reason,
        bytes: if resume_token.is_some() { bytes } else { 0 },
        resume_token,
    }
}

async fn settle_failed(error: TransferError, attempt: &Attempt) -> TransferOutcome {
    let keep_partial = matches!(classify_error(&error), FailureType::Transient | FailureType::ExpiredSource)
        && !matches!(error, TransferError::Integrity { .. });

    let bytes = staged_len(&attempt.paths.part).await;
    let resume_token = keep_partial
        .then(|| {
            ResumeState::capture(
                &attempt.url,
                bytes,
                attempt.validator.as_deref(),
                attempt.accepts_ranges,
                attempt.total,
            )
        })
        .flatten();
    if resume_token.is_none()
        && let Err(err) = attempt.paths.discard().await
    {
        warn!(error = %err, "failed to discard staging files");
    }

    warn!(error = %error, resumable = resume_token.is_some(), "transfer failed");
    TransferOutcome::Failed {
        error,
        bytes: if resume_token.is_some() { bytes } else { 0 },
        resume_token,
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, TransferError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| TransferError::io(dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TransferError::io(dir, e))?
    {
        files.push(entry.path());
    }
    Ok(files)
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %err, "failed to remove staging file");
    }
}
