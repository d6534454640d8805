//! One admitted attempt: source resolution followed by the transfer.
//!
//! Runs on its own tokio task, outside the scheduler lock. The only store
//! write it makes is recording a freshly resolved source on its own task row.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::api::{ApiError, ChapterPayload, ContentApi, ResolvedSource};
use crate::store::{TaskKind, TaskStore, TransferTask};
use crate::transfer::{
    ProgressSink, StopListener, TransferError, TransferExecutor, TransferOutcome, TransferRequest,
};

/// Handles an attempt needs; cloned out of the scheduler at admission.
pub(super) struct JobContext {
    pub api: Arc<dyn ContentApi>,
    pub tasks: TaskStore,
    pub executor: TransferExecutor,
}

enum Source {
    Url(String),
    Inline(Vec<u8>),
}

#[instrument(skip_all, fields(task = %task.id, retry_count = task.retry_count))]
pub(super) async fn run_attempt(
    ctx: JobContext,
    task: TransferTask,
    stop: StopListener,
    sink: ProgressSink,
) -> TransferOutcome {
    let url = match resolve_source(&ctx, &task).await {
        Ok(Source::Url(url)) => url,
        Ok(Source::Inline(bytes)) => return stage_inline(&ctx, &task, &bytes).await,
        Err(error) => {
            return TransferOutcome::Failed {
                error,
                resume_token: task.resume_token.clone(),
                bytes: task.bytes_transferred,
            };
        }
    };

    ctx.executor
        .run(
            TransferRequest {
                id: task.id.clone(),
                url,
                resume: task.resume_token.clone(),
            },
            stop,
            sink,
        )
        .await
}

/// Uses the stored source unless it is missing or flagged as expired.
async fn resolve_source(ctx: &JobContext, task: &TransferTask) -> Result<Source, TransferError> {
    if !task.needs_resolve
        && let Some(url) = &task.source_location
    {
        return Ok(Source::Url(url.clone()));
    }

    let target = task.id.to_string();
    let resolved: ResolvedSource = if task.id.kind == TaskKind::ChapterText {
        match ctx
            .api
            .fetch_chapter_payload(&task.id)
            .await
            .map_err(|e| api_error(&target, &e))?
        {
            ChapterPayload::Inline(bytes) => return Ok(Source::Inline(bytes)),
            ChapterPayload::Remote(source) => source,
        }
    } else {
        ctx.api
            .resolve_download_url(&task.id)
            .await
            .map_err(|e| api_error(&target, &e))?
    };

    if let Err(err) = ctx
        .tasks
        .set_source(&task.id, &resolved.url, resolved.expected_bytes)
        .await
    {
        warn!(error = %err, "failed to persist resolved source");
    }
    debug!(url = %resolved.url, expected_bytes = resolved.expected_bytes, "source resolved");
    Ok(Source::Url(resolved.url))
}

async fn stage_inline(ctx: &JobContext, task: &TransferTask, bytes: &[u8]) -> TransferOutcome {
    match ctx.executor.stage_inline(&task.id, bytes).await {
        Ok(staged_path) => TransferOutcome::Completed {
            staged_path,
            bytes: bytes.len() as u64,
        },
        Err(error) => TransferOutcome::Failed {
            error,
            resume_token: None,
            bytes: 0,
        },
    }
}

fn api_error(target: &str, error: &ApiError) -> TransferError {
    TransferError::resolve(target, error.to_string(), error.is_not_found())
}
