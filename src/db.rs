use crate::model::{NewPerson, PopulationState, Recipient, SendState};
use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{instrument, warn};
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the parent
/// directory exists. In-memory URLs and other schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Populations & persons (recipient source)
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn ensure_population(
    pool: &Pool,
    id: &str,
    name: &str,
    owner_user_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO populations (id, name, owner_user_id) VALUES (?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
    )
    .bind(id)
    .bind(name)
    .bind(owner_user_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_population_status(
    pool: &Pool,
    population_id: &str,
    state: PopulationState,
) -> Result<()> {
    sqlx::query("UPDATE populations SET status = ? WHERE id = ?")
        .bind(state.as_str())
        .bind(population_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn population_status(pool: &Pool, population_id: &str) -> Result<Option<String>> {
    let status =
        sqlx::query_scalar::<_, Option<String>>("SELECT status FROM populations WHERE id = ?")
            .bind(population_id)
            .fetch_optional(pool)
            .await?;
    Ok(status.flatten())
}

#[instrument(skip_all)]
pub async fn count_persons(pool: &Pool, population_id: &str) -> Result<i64> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM persons WHERE population_id = ?")
        .bind(population_id)
        .fetch_one(pool)
        .await?;
    Ok(total)
}

/// Fetch one page of recipients in stable insertion order, plus whether a
/// further page exists. Fetches `page_size + 1` rows to learn the latter
/// without a second count.
#[instrument(skip_all)]
pub async fn fetch_person_page(
    pool: &Pool,
    population_id: &str,
    page: i64,
    page_size: i64,
) -> Result<(Vec<Recipient>, bool)> {
    let offset = (page - 1) * page_size;
    let rows = sqlx::query(
        "SELECT id, email, name, phone FROM persons WHERE population_id = ?
         ORDER BY rowid LIMIT ? OFFSET ?",
    )
    .bind(population_id)
    .bind(page_size + 1)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let has_next = rows.len() as i64 > page_size;
    let recipients = rows
        .into_iter()
        .take(page_size as usize)
        .map(|row| Recipient {
            id: row.get("id"),
            email: row.get("email"),
            name: row.get("name"),
            phone: row.get("phone"),
        })
        .collect();
    Ok((recipients, has_next))
}

/// Batched idempotent insert. Duplicate emails within the population are
/// ignored; returns how many rows were actually inserted.
#[instrument(skip_all)]
pub async fn insert_persons(
    pool: &Pool,
    population_id: &str,
    persons: &[NewPerson],
) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0u64;
    for person in persons {
        let custom = serde_json::to_string(&person.custom_fields)?;
        let res = sqlx::query(
            "INSERT OR IGNORE INTO persons (id, population_id, email, name, phone, custom_fields)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(population_id)
        .bind(&person.email)
        .bind(&person.name)
        .bind(&person.phone)
        .bind(custom)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            warn!(email = %person.email, "duplicate person skipped");
        } else {
            inserted += 1;
        }
    }
    tx.commit().await?;
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Access ledger (idempotency key per survey+person)
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn access_person_ids(pool: &Pool, survey_id: &str) -> Result<HashSet<String>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT person_id FROM survey_access WHERE survey_id = ?")
            .bind(survey_id)
            .fetch_all(pool)
            .await?;
    Ok(ids.into_iter().collect())
}

#[instrument(skip_all)]
pub async fn create_access_record(
    pool: &Pool,
    survey_id: &str,
    person_id: &str,
    token: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO survey_access (survey_id, person_id, token) VALUES (?, ?, ?)")
        .bind(survey_id)
        .bind(person_id)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Survey send-status (status reporter)
// ---------------------------------------------------------------------------

/// Record a `Processing` update. Ignored once the survey has reached a
/// terminal state, so late updates from retried pages cannot resurrect it.
#[instrument(skip_all)]
pub async fn update_survey_processing(
    pool: &Pool,
    survey_id: &str,
    job_id: Option<i64>,
    progress: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO survey_send_status (survey_id, state, progress, job_id)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(survey_id) DO UPDATE SET
             progress = excluded.progress,
             job_id = excluded.job_id,
             updated_at = CURRENT_TIMESTAMP
         WHERE survey_send_status.state = 'processing'",
    )
    .bind(survey_id)
    .bind(SendState::Processing.as_str())
    .bind(progress)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move the survey to a terminal state. A no-op when a terminal state is
/// already recorded, which makes the defensive completion check safe.
#[instrument(skip_all)]
pub async fn finalize_survey_status(
    pool: &Pool,
    survey_id: &str,
    state: SendState,
    progress: i64,
) -> Result<()> {
    debug_assert!(state != SendState::Processing);
    sqlx::query(
        "INSERT INTO survey_send_status (survey_id, state, progress)
         VALUES (?, ?, ?)
         ON CONFLICT(survey_id) DO UPDATE SET
             state = excluded.state,
             progress = excluded.progress,
             updated_at = CURRENT_TIMESTAMP
         WHERE survey_send_status.state = 'processing'",
    )
    .bind(survey_id)
    .bind(state.as_str())
    .bind(progress)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn survey_status(pool: &Pool, survey_id: &str) -> Result<Option<(String, i64)>> {
    let row =
        sqlx::query("SELECT state, progress FROM survey_send_status WHERE survey_id = ?")
            .bind(survey_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| (r.get("state"), r.get("progress"))))
}
