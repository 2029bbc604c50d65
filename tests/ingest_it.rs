use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use std::sync::Arc;
use survey_courier::model::{CustomFields, CustomValue, IngestionPayload, JobKind, PopulationRef};
use survey_courier::notify::Notifier;
use survey_courier::token::TokenIssuer;
use survey_courier::worker::{self, WorkerCtx};
use survey_courier::{db, jobs};
use tempfile::TempDir;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Ingestion never sends anything; a notifier that refuses all calls keeps the
/// test honest.
struct NoNotifier;

#[async_trait]
impl Notifier for NoNotifier {
    async fn send_email(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
        panic!("ingestion must not send email");
    }

    async fn send_whatsapp(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
        panic!("ingestion must not send whatsapp");
    }
}

fn ctx(pool: &sqlx::SqlitePool, batch_size: usize) -> WorkerCtx {
    WorkerCtx {
        pool: pool.clone(),
        notifier: Arc::new(NoNotifier),
        tokens: TokenIssuer::new("test-secret".into(), 30),
        ingest_batch_size: batch_size,
        max_backoff_secs: 3600,
    }
}

fn payload(file_path: &str) -> IngestionPayload {
    IngestionPayload {
        file_path: file_path.into(),
        population: PopulationRef {
            id: "pop-1".into(),
            name: "Imported".into(),
            user_id: "user-1".into(),
        },
        last_row: 0,
        total: 0,
    }
}

async fn enqueue_and_run(pool: &sqlx::SqlitePool, ctx: &WorkerCtx, payload: &IngestionPayload) {
    jobs::enqueue(
        pool,
        JobKind::IngestSpreadsheet,
        payload,
        jobs::RetryPolicy::ingestion(),
        Utc::now(),
    )
    .await
    .unwrap();
    assert!(worker::process_next_job(ctx).await.unwrap());
}

#[tokio::test]
async fn malformed_rows_are_dropped_without_aborting_the_file() {
    let pool = setup_pool().await;
    let ctx = ctx(&pool, 2);
    let td = TempDir::new().unwrap();
    let file = td.path().join("roster.csv");
    std::fs::write(
        &file,
        "email,name,phone,team,score,active,joined_at\n\
         a@x.com,Alice,+491,ops,3.5,true,2024-05-01\n\
         not-an-email,Bob,,,,,\n\
         b@x.com,,,,,,\n\
         c@x.com,Cara,,eng,7,false,\n\
         a@x.com,Alice Again,,,,,\n",
    )
    .unwrap();

    let payload = payload(file.to_str().unwrap());
    enqueue_and_run(&pool, &ctx, &payload).await;

    // 5 rows: 2 valid and unique, 2 malformed, 1 duplicate email.
    assert_eq!(db::count_persons(&pool, "pop-1").await.unwrap(), 2);
    assert_eq!(
        db::population_status(&pool, "pop-1").await.unwrap().as_deref(),
        Some("completed")
    );
    // Source file deleted exactly once on the terminal callback.
    assert!(!file.exists());
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    // Extra columns land in the typed custom-fields map.
    let custom: String =
        sqlx::query_scalar("SELECT custom_fields FROM persons WHERE email = 'a@x.com'")
            .fetch_one(&pool)
            .await
            .unwrap();
    let custom: CustomFields = serde_json::from_str(&custom).unwrap();
    assert_eq!(custom.get("team"), Some(&CustomValue::Text("ops".into())));
    assert_eq!(custom.get("score"), Some(&CustomValue::Number(3.5)));
    assert_eq!(custom.get("active"), Some(&CustomValue::Bool(true)));
    assert_eq!(
        custom.get("joined_at"),
        Some(&CustomValue::Timestamp(
            "2024-05-01T00:00:00Z".parse().unwrap()
        ))
    );
}

#[tokio::test]
async fn missing_file_fails_the_job_and_finalizes_failed() {
    let pool = setup_pool().await;
    let ctx = ctx(&pool, 500);
    db::ensure_population(&pool, "pop-1", "Imported", Some("user-1"))
        .await
        .unwrap();

    let payload = payload("/nonexistent/roster.csv");
    enqueue_and_run(&pool, &ctx, &payload).await;

    assert_eq!(
        db::population_status(&pool, "pop-1").await.unwrap().as_deref(),
        Some("failed")
    );
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(db::count_persons(&pool, "pop-1").await.unwrap(), 0);
}

#[tokio::test]
async fn large_file_ingests_in_batches() {
    let pool = setup_pool().await;
    let ctx = ctx(&pool, 100);
    let td = TempDir::new().unwrap();
    let file = td.path().join("big.csv");

    let mut content = String::from("email,name,phone\n");
    for i in 0..250 {
        content.push_str(&format!("p{i}@example.com,Person {i},\n"));
    }
    std::fs::write(&file, &content).unwrap();

    let payload = payload(file.to_str().unwrap());
    enqueue_and_run(&pool, &ctx, &payload).await;

    assert_eq!(db::count_persons(&pool, "pop-1").await.unwrap(), 250);
    assert_eq!(
        db::population_status(&pool, "pop-1").await.unwrap().as_deref(),
        Some("completed")
    );
    assert!(!Path::new(&payload.file_path).exists());
}
