//! Polling worker: delivers due jobs to the drivers and runs the lifecycle
//! callbacks (defensive completion, terminal-failure cleanup). Strictly one
//! job in flight, so dispatch pages execute in order.
use crate::db::{self, Pool};
use crate::dispatch::{self, PageOutcome};
use crate::files;
use crate::ingest;
use crate::jobs::{self, DueJob};
use crate::model::{DispatchPayload, IngestionPayload, JobKind, PopulationState, SendState};
use crate::notify::Notifier;
use crate::token::TokenIssuer;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

pub struct WorkerCtx {
    pub pool: Pool,
    pub notifier: Arc<dyn Notifier>,
    pub tokens: TokenIssuer,
    pub ingest_batch_size: usize,
    pub max_backoff_secs: i64,
}

/// Process at most one due job. Returns whether anything was picked up.
#[instrument(skip_all)]
pub async fn process_next_job(ctx: &WorkerCtx) -> Result<bool> {
    let Some(job) = jobs::next_due(&ctx.pool).await? else {
        return Ok(false);
    };

    match JobKind::parse(&job.kind) {
        Some(JobKind::DispatchSurvey) => run_dispatch(ctx, &job).await?,
        Some(JobKind::IngestSpreadsheet) => run_ingestion(ctx, &job).await?,
        None => {
            error!(id = job.id, kind = %job.kind, "unknown job kind; dropping");
            jobs::delete(&ctx.pool, job.id).await?;
        }
    }
    Ok(true)
}

async fn run_dispatch(ctx: &WorkerCtx, job: &DueJob) -> Result<()> {
    let mut payload: DispatchPayload = match serde_json::from_str(&job.payload) {
        Ok(p) => p,
        Err(err) => {
            error!(?err, id = job.id, "undecodable dispatch payload; dropping");
            jobs::delete(&ctx.pool, job.id).await?;
            return Ok(());
        }
    };

    match dispatch::run_page(
        &ctx.pool,
        ctx.notifier.as_ref(),
        &ctx.tokens,
        job.id,
        &mut payload,
    )
    .await
    {
        Ok(PageOutcome::Continue) => {
            jobs::delete(&ctx.pool, job.id).await?;
        }
        Ok(PageOutcome::Done) => {
            jobs::delete(&ctx.pool, job.id).await?;
            // Defensive completion check; a no-op when the final page already
            // recorded it.
            db::finalize_survey_status(&ctx.pool, &payload.survey_id, SendState::Completed, 100)
                .await?;
            info!(survey_id = %payload.survey_id, "dispatch chain completed");
        }
        Err(err) => {
            if job.attempt + 1 >= job.max_attempts {
                error!(?err, id = job.id, attempt = job.attempt, "dispatch page failed terminally");
                jobs::delete(&ctx.pool, job.id).await?;
                db::finalize_survey_status(&ctx.pool, &payload.survey_id, SendState::Failed, 0)
                    .await?;
            } else {
                warn!(?err, id = job.id, attempt = job.attempt, "dispatch page failed; backoff");
                jobs::backoff(
                    &ctx.pool,
                    job.id,
                    job.attempt,
                    job.backoff_base_secs,
                    ctx.max_backoff_secs,
                )
                .await?;
            }
        }
    }
    Ok(())
}

async fn run_ingestion(ctx: &WorkerCtx, job: &DueJob) -> Result<()> {
    let payload: IngestionPayload = match serde_json::from_str(&job.payload) {
        Ok(p) => p,
        Err(err) => {
            error!(?err, id = job.id, "undecodable ingestion payload; dropping");
            jobs::delete(&ctx.pool, job.id).await?;
            return Ok(());
        }
    };

    match ingest::run(&ctx.pool, job.id, &payload, ctx.ingest_batch_size).await {
        Ok(report) => {
            finish_ingestion(ctx, job, &payload, PopulationState::Completed).await?;
            info!(
                population_id = %payload.population.id,
                inserted = report.inserted,
                skipped = report.skipped,
                "ingestion completed"
            );
        }
        Err(err) => {
            if job.attempt + 1 >= job.max_attempts {
                error!(?err, id = job.id, "ingestion failed terminally");
                finish_ingestion(ctx, job, &payload, PopulationState::Failed).await?;
            } else {
                warn!(?err, id = job.id, attempt = job.attempt, "ingestion failed; backoff");
                jobs::backoff(
                    &ctx.pool,
                    job.id,
                    job.attempt,
                    job.backoff_base_secs,
                    ctx.max_backoff_secs,
                )
                .await?;
            }
        }
    }
    Ok(())
}

/// Terminal ingestion callback: the uploaded file is deleted exactly once,
/// from either outcome, and the population status is finalized from the
/// payload's population id.
async fn finish_ingestion(
    ctx: &WorkerCtx,
    job: &DueJob,
    payload: &IngestionPayload,
    state: PopulationState,
) -> Result<()> {
    if let Err(err) = files::remove_upload(&payload.file_path).await {
        warn!(?err, path = %payload.file_path, "failed to delete upload");
    }
    db::set_population_status(&ctx.pool, &payload.population.id, state).await?;
    jobs::delete(&ctx.pool, job.id).await?;
    Ok(())
}

/// Worker loop in the poll/sleep shape; runs until the task is dropped.
pub async fn run(ctx: WorkerCtx, poll_interval: Duration) {
    info!("starting job worker");
    loop {
        match process_next_job(&ctx).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            Err(err) => {
                error!(?err, "worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
