use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use survey_courier::model::{DeliveryMode, DispatchPayload, IngestionPayload, PopulationRef};
use survey_courier::notify::HttpNotifier;
use survey_courier::token::TokenIssuer;
use survey_courier::worker::WorkerCtx;
use survey_courier::{config, db, files, jobs, worker};
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the job worker until interrupted.
    Serve,
    /// Enqueue a survey dispatch chain.
    Dispatch {
        #[arg(long)]
        survey_id: String,
        #[arg(long)]
        population_id: String,
        #[arg(long)]
        title: String,
        /// Comma-separated delivery modes (email, whatsapp).
        #[arg(long, value_delimiter = ',', default_value = "email")]
        modes: Vec<String>,
        #[arg(long)]
        page_size: Option<i64>,
    },
    /// Stage a spreadsheet and enqueue its ingestion.
    Ingest {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        population_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/courier.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Serve => {
            let notifier = HttpNotifier::from_config(&cfg)?;
            let ctx = WorkerCtx {
                pool,
                notifier: Arc::new(notifier),
                tokens: TokenIssuer::new(cfg.auth.token_secret.clone(), cfg.auth.token_ttl_days),
                ingest_batch_size: cfg.app.ingest_batch_size,
                max_backoff_secs: cfg.app.max_backoff_seconds as i64,
            };
            let poll = Duration::from_millis(cfg.app.poll_interval_ms);
            tokio::select! {
                _ = worker::run(ctx, poll) => {}
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
        Command::Dispatch {
            survey_id,
            population_id,
            title,
            modes,
            page_size,
        } => {
            let mut delivery_modes = Vec::new();
            for raw in &modes {
                match DeliveryMode::parse(raw) {
                    Some(mode) if !delivery_modes.contains(&mode) => delivery_modes.push(mode),
                    Some(_) => {}
                    None => bail!("unknown delivery mode: {raw}"),
                }
            }
            if delivery_modes.is_empty() {
                bail!("at least one delivery mode is required");
            }
            // Refuse a second chain while one is still running for this survey.
            if let Some((state, _)) = db::survey_status(&pool, &survey_id).await? {
                if state == "processing" {
                    bail!("survey {survey_id} already has a dispatch in progress");
                }
            }
            let payload = DispatchPayload::new(
                survey_id,
                population_id,
                title,
                delivery_modes,
                page_size.unwrap_or(cfg.app.page_size),
            );
            let job_id = jobs::enqueue(
                &pool,
                survey_courier::model::JobKind::DispatchSurvey,
                &payload,
                jobs::RetryPolicy::dispatch(),
                Utc::now(),
            )
            .await?;
            println!("enqueued dispatch job {job_id}");
        }
        Command::Ingest {
            file,
            population_id,
            name,
            user_id,
        } => {
            let staged = files::stage_upload(&cfg.app.data_dir, &file)
                .await
                .context("failed to stage spreadsheet")?;
            db::ensure_population(&pool, &population_id, &name, Some(&user_id)).await?;
            let payload = IngestionPayload {
                file_path: staged,
                population: PopulationRef {
                    id: population_id,
                    name,
                    user_id,
                },
                last_row: 0,
                total: 0,
            };
            let job_id = jobs::enqueue(
                &pool,
                survey_courier::model::JobKind::IngestSpreadsheet,
                &payload,
                jobs::RetryPolicy::ingestion(),
                Utc::now(),
            )
            .await?;
            println!("enqueued ingestion job {job_id}");
        }
    }

    Ok(())
}
