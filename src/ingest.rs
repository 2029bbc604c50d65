//! Ingestion driver: stream an uploaded spreadsheet into a population. Rows
//! are buffered into fixed-size batches and inserted idempotently; a
//! malformed row is dropped and counted, never aborting the file.
use crate::db::{self, Pool};
use crate::jobs;
use crate::model::{percent, IngestionPayload, NewPerson, PopulationState};
use crate::spreadsheet;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, instrument, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub total_rows: i64,
    pub inserted: u64,
    pub skipped: u64,
}

/// Run one ingestion unit of work. The terminal callbacks (file deletion and
/// final population status) belong to the worker, not to this driver.
#[instrument(skip_all, fields(population_id = %payload.population.id))]
pub async fn run(
    pool: &Pool,
    job_id: i64,
    payload: &IngestionPayload,
    batch_size: usize,
) -> Result<IngestReport> {
    db::ensure_population(
        pool,
        &payload.population.id,
        &payload.population.name,
        Some(&payload.population.user_id),
    )
    .await?;
    db::set_population_status(pool, &payload.population.id, PopulationState::Working).await?;

    // The file is local, so the row total is cheap to know up front and makes
    // per-batch progress meaningful.
    let total_rows = count_data_rows(&payload.file_path)?;
    let mut tracked = payload.clone();
    tracked.total = total_rows;
    jobs::update_payload(pool, job_id, &tracked).await?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(&payload.file_path)
        .with_context(|| format!("failed to open upload {}", payload.file_path))?;
    let headers = reader.headers()?.clone();

    let mut report = IngestReport {
        total_rows,
        ..Default::default()
    };
    let mut consumed = 0i64;
    let mut buffer: Vec<NewPerson> = Vec::with_capacity(batch_size);

    for record in reader.records() {
        consumed += 1;
        match record {
            Ok(record) => match spreadsheet::parse_row(&headers, &record) {
                Ok(person) => buffer.push(person),
                Err(err) => {
                    warn!(?err, row = consumed, "malformed row dropped");
                    report.skipped += 1;
                }
            },
            Err(err) => {
                warn!(?err, row = consumed, "unreadable row dropped");
                report.skipped += 1;
            }
        }

        if buffer.len() >= batch_size {
            flush(pool, job_id, &mut tracked, &mut buffer, consumed, &mut report).await?;
        }
    }
    flush(pool, job_id, &mut tracked, &mut buffer, consumed, &mut report).await?;

    jobs::update_progress(pool, job_id, 100).await?;
    info!(
        total_rows,
        inserted = report.inserted,
        skipped = report.skipped,
        "ingestion finished"
    );
    Ok(report)
}

async fn flush(
    pool: &Pool,
    job_id: i64,
    payload: &mut IngestionPayload,
    buffer: &mut Vec<NewPerson>,
    consumed: i64,
    report: &mut IngestReport,
) -> Result<()> {
    if !buffer.is_empty() {
        let inserted = db::insert_persons(pool, &payload.population.id, buffer).await?;
        report.skipped += buffer.len() as u64 - inserted;
        report.inserted += inserted;
        buffer.clear();
    }
    payload.last_row = consumed;
    jobs::update_payload(pool, job_id, payload).await?;
    jobs::update_progress(pool, job_id, percent(consumed, payload.total)).await?;
    Ok(())
}

/// Count data rows (header excluded) in a single cheap pass.
fn count_data_rows(path: &str) -> Result<i64> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(Path::new(path))
        .with_context(|| format!("failed to open upload {}", path))?;
    let mut total = 0i64;
    for record in reader.records() {
        let _ = record;
        total += 1;
    }
    Ok(total)
}
