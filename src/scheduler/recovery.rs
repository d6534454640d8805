//! Startup reconciliation of the task store against the staging area.
//!
//! A previous process may have died at any point of a transfer. For every
//! task left `downloading`, and every staging session on disk:
//!
//! | Found | Action |
//! |-------|--------|
//! | payload already committed | mark completed |
//! | complete staging session | commit, mark completed |
//! | partial session with resume data | keep token, re-queue |
//! | partial session without resume data | discard, re-queue from zero |
//! | no session | re-queue from zero |
//! | session with no task row | discard |

use std::collections::{BTreeSet, HashMap};

use tracing::{info, instrument, warn};

use super::{Scheduler, SchedulerError};
use crate::store::{TaskId, TaskStatus, TransferTask};
use crate::transfer::{RecoveredSession, RecoveredState};

/// What [`Scheduler::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks completed from a finished staging file or an already stored payload.
    pub committed: usize,
    /// Tasks that will continue from a resume token.
    pub resumable: usize,
    /// Interrupted tasks that will restart from zero.
    pub restarted: usize,
    /// Staging sessions deleted because nothing claims them.
    pub discarded: usize,
}

impl Scheduler {
    /// Reconciles persisted task state with the staging area.
    ///
    /// Must run before [`Scheduler::start`].
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Transfer`] if the staging directory cannot be
    /// read, or [`SchedulerError::Store`] if the task store cannot be listed.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, SchedulerError> {
        let inner = &self.inner;
        let state = inner.state.lock().await;

        let mut sessions: HashMap<TaskId, RecoveredSession> = inner
            .executor
            .recover_sessions()
            .await?
            .into_iter()
            .map(|session| (session.id.clone(), session))
            .collect();

        let mut report = RecoveryReport::default();
        let mut touched = BTreeSet::new();

        for task in inner.tasks.list_all().await? {
            let session = sessions.remove(&task.id);
            if task.status.is_terminal() {
                if session.is_some() {
                    inner.release_staging(&task.id).await;
                    report.discarded += 1;
                }
                continue;
            }

            let interrupted = task.status == TaskStatus::Downloading;
            if interrupted && inner.content.exists(task.destination_tier, &task.id).await {
                let bytes = inner
                    .content
                    .indexed_size(task.destination_tier, &task.id)
                    .unwrap_or(task.bytes_transferred);
                inner.tasks.mark_completed(&task.id, bytes).await?;
                inner.release_staging(&task.id).await;
                report.committed += 1;
                touched.insert(task.id.resource_id.clone());
                continue;
            }

            match session {
                Some(session) if session.state == RecoveredState::Complete => {
                    if self.commit_recovered(&task, &session).await? {
                        report.committed += 1;
                    } else {
                        report.restarted += 1;
                    }
                }
                Some(session) => {
                    let token = session.resume_token.as_ref();
                    let bytes = if token.is_some() { session.bytes } else { 0 };
                    if token.is_none() {
                        inner.release_staging(&task.id).await;
                    }
                    inner
                        .tasks
                        .store_resume_token(&task.id, token, bytes)
                        .await?;
                    if interrupted {
                        inner.tasks.requeue(&task.id).await?;
                    }
                    if token.is_some() {
                        report.resumable += 1;
                    } else {
                        report.restarted += 1;
                    }
                }
                None if interrupted => {
                    inner.tasks.store_resume_token(&task.id, None, 0).await?;
                    inner.tasks.requeue(&task.id).await?;
                    report.restarted += 1;
                }
                None => continue,
            }
            touched.insert(task.id.resource_id.clone());
        }

        for (id, _) in sessions {
            warn!(task = %id, "staging session without a task; discarding");
            inner.release_staging(&id).await;
            report.discarded += 1;
        }
        drop(state);

        for resource_id in touched {
            inner.refresh_record(&resource_id).await;
        }
        info!(?report, "recovery finished");
        Ok(report)
    }

    /// Commits a finished staging file. Returns `false` when the commit
    /// failed and the task was re-queued from zero instead.
    async fn commit_recovered(
        &self,
        task: &TransferTask,
        session: &RecoveredSession,
    ) -> Result<bool, SchedulerError> {
        let inner = &self.inner;
        match inner
            .content
            .commit(task.destination_tier, &task.id, &session.staged_path)
            .await
        {
            Ok(_) => {
                inner.tasks.mark_completed(&task.id, session.bytes).await?;
                inner.release_staging(&task.id).await;
                Ok(true)
            }
            Err(err) => {
                warn!(task = %task.id, error = %err, "failed to commit recovered payload");
                inner.release_staging(&task.id).await;
                inner.tasks.store_resume_token(&task.id, None, 0).await?;
                if task.status == TaskStatus::Downloading {
                    inner.tasks.requeue(&task.id).await?;
                }
                Ok(false)
            }
        }
    }
}
