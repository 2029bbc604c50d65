//! Dispatch driver: one population page per unit of work. Each invocation
//! processes its page idempotently, persists the cursor back into the job
//! payload and either re-enqueues the next page or finalizes the survey
//! status.
use crate::db::{self, Pool};
use crate::jobs::{self, RetryPolicy};
use crate::model::{percent, DeliveryMode, DispatchPayload, JobKind, Recipient, SendState};
use crate::notify::Notifier;
use crate::token::TokenIssuer;
use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Next page enqueued; the chain continues.
    Continue,
    /// Last page processed; survey finalized `Completed`.
    Done,
}

/// Run one page of a dispatch chain. Any error escaping the page marks the
/// survey `Failed` before propagating, so external observers see the failure
/// even while the scheduler still retries.
#[instrument(skip_all, fields(survey_id = %payload.survey_id, page = payload.page))]
pub async fn run_page(
    pool: &Pool,
    notifier: &dyn Notifier,
    tokens: &TokenIssuer,
    job_id: i64,
    payload: &mut DispatchPayload,
) -> Result<PageOutcome> {
    let result = run_page_inner(pool, notifier, tokens, job_id, payload).await;
    if let Err(err) = &result {
        warn!(?err, "page failed; marking survey failed");
        if let Err(status_err) =
            db::finalize_survey_status(pool, &payload.survey_id, SendState::Failed, 0).await
        {
            warn!(?status_err, "failed to record failed status");
        }
    }
    result
}

async fn run_page_inner(
    pool: &Pool,
    notifier: &dyn Notifier,
    tokens: &TokenIssuer,
    job_id: i64,
    payload: &mut DispatchPayload,
) -> Result<PageOutcome> {
    if payload.page == 1 {
        db::update_survey_processing(pool, &payload.survey_id, Some(job_id), 0).await?;
        // The total is fixed once and carried in the payload from then on; a
        // page-1 retry that already persisted it must not recompute it.
        if payload.total_persons.is_none() {
            let total = db::count_persons(pool, &payload.population_id).await?;
            payload.total_persons = Some(total);
            jobs::update_payload(pool, job_id, payload).await?;
        }
    }

    let total = payload
        .total_persons
        .ok_or_else(|| anyhow!("job payload missing total_persons past page 1"))?;

    let (recipients, has_next) =
        db::fetch_person_page(pool, &payload.population_id, payload.page, payload.page_size)
            .await?;

    // Re-read the ledger on every page so a page retried after partial
    // completion skips the recipients it already covered.
    let already = db::access_person_ids(pool, &payload.survey_id).await?;

    let mut processed = payload.last_processed_index;
    let (mut sent, mut skipped, mut failed) = (0u32, 0u32, 0u32);
    for recipient in &recipients {
        if already.contains(&recipient.id) {
            skipped += 1;
        } else {
            match dispatch_one(pool, notifier, tokens, payload, recipient).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(?err, person_id = %recipient.id, "recipient dispatch failed; continuing");
                    failed += 1;
                }
            }
        }
        processed += 1;
        let progress = percent(processed, total);
        jobs::update_progress(pool, job_id, progress).await?;
        db::update_survey_processing(pool, &payload.survey_id, Some(job_id), progress).await?;
    }

    payload.last_processed_index = processed;
    jobs::update_payload(pool, job_id, payload).await?;
    info!(
        page = payload.page,
        sent, skipped, failed, has_next, "page processed"
    );

    if has_next {
        let mut next = payload.clone();
        next.page += 1;
        jobs::enqueue(
            pool,
            JobKind::DispatchSurvey,
            &next,
            RetryPolicy::dispatch(),
            Utc::now(),
        )
        .await?;
        Ok(PageOutcome::Continue)
    } else {
        db::finalize_survey_status(pool, &payload.survey_id, SendState::Completed, 100).await?;
        Ok(PageOutcome::Done)
    }
}

/// Issue a token, write the access record, then attempt every selected
/// channel. The record is the idempotency key: once it exists this recipient
/// is never dispatched again, even if a send below fails.
async fn dispatch_one(
    pool: &Pool,
    notifier: &dyn Notifier,
    tokens: &TokenIssuer,
    payload: &DispatchPayload,
    recipient: &Recipient,
) -> Result<()> {
    let token = tokens.sign(&payload.survey_id, &recipient.id)?;
    db::create_access_record(pool, &payload.survey_id, &recipient.id, &token).await?;

    for mode in &payload.delivery_modes {
        match mode {
            DeliveryMode::Email => {
                if let Err(err) = notifier
                    .send_email(&recipient.email, &recipient.name, &token, &payload.survey_title)
                    .await
                {
                    warn!(?err, email = %recipient.email, "email send failed");
                }
            }
            DeliveryMode::Whatsapp => match &recipient.phone {
                Some(phone) => {
                    if let Err(err) = notifier
                        .send_whatsapp(phone, &recipient.name, &token, &payload.survey_title)
                        .await
                    {
                        warn!(?err, phone = %phone, "whatsapp send failed");
                    }
                }
                None => {
                    debug!(person_id = %recipient.id, "no phone number; whatsapp skipped");
                }
            },
        }
    }
    Ok(())
}
