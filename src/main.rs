use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use meal_pulse::models::{AnonymizedId, MealType, PrivacyUpdate, ResponseType};
use meal_pulse::service::{MealInput, SourceInput, StudentKey};
use meal_pulse::{
    db, report, to_api_value, Anonymizer, DeliveryQueue, IngestRequest, LogNotifier, MealPulse,
    MessageComposer, PgStore, PulseConfig, SystemClock,
};

#[derive(Parser)]
#[command(name = "meal-pulse")]
#[command(about = "Privacy-preserving meal attendance monitoring for Group Scholar", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Ingest 45 days of demo attendance for three students
    Seed,
    /// Import attendance from a college dining export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Ingest one meal observation
    Ingest {
        #[arg(long)]
        college_id: String,
        #[arg(long)]
        enrollment_year: Option<String>,
        #[arg(long)]
        department: Option<String>,
        /// Defaults to a token minted for today
        #[arg(long)]
        college_token: Option<String>,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        meal_type: MealType,
        #[arg(long)]
        missed: bool,
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
        #[arg(long, default_value = "cli")]
        college_system: String,
    },
    /// Run pattern analysis for a student
    Analyze {
        #[arg(long)]
        student: AnonymizedId,
    },
    /// Generate a markdown pattern report
    Report {
        #[arg(long)]
        student: AnonymizedId,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Update privacy preferences
    Privacy {
        #[arg(long)]
        student: AnonymizedId,
        #[arg(long)]
        opt_out: Option<bool>,
        #[arg(long)]
        allow_check_ins: Option<bool>,
        #[arg(long)]
        retention_days: Option<i64>,
    },
    /// Record a response to a check-in
    Respond {
        #[arg(long)]
        student: AnonymizedId,
        #[arg(long)]
        check_in: Uuid,
        #[arg(long)]
        response: ResponseType,
        #[arg(long)]
        text: Option<String>,
    },
    /// Delete expired records
    Purge,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let value = to_api_value(value).context("failed to serialize output")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PulseConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    if let Commands::InitDb = cli.command {
        db::init_db(&pool).await.context("failed to run migrations")?;
        println!("Schema ready.");
        return Ok(());
    }

    let secret = config
        .secret
        .clone()
        .context("MEAL_PULSE_SECRET must be set to the anonymization secret")?;
    let anonymizer = Anonymizer::new(secret)?;
    let notifier = Arc::new(LogNotifier {
        method: config.delivery.method,
    });
    let queue_capacity = config.delivery.queue_capacity;
    let pulse = MealPulse::new(
        anonymizer,
        Arc::new(PgStore::new(pool)),
        notifier,
        Arc::new(SystemClock),
        MessageComposer::default(),
        config,
    );
    let (queue, worker) = DeliveryQueue::spawn(pulse.courier(), queue_capacity);
    let pulse = pulse.with_delivery_queue(queue);

    let result = run(&pulse, cli.command).await;
    drop(pulse);
    let delivered = worker.shutdown().await;
    tracing::debug!(delivered, "delivery queue drained");
    result
}

async fn run(pulse: &MealPulse, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::InitDb => {}
        Commands::Seed => {
            let ingested = db::seed(pulse).await?;
            println!("Seeded {ingested} meal observations.");
        }
        Commands::Import { csv } => {
            let ingested = db::import_csv(pulse, &csv).await?;
            println!("Ingested {ingested} meal observations from {}.", csv.display());
        }
        Commands::Ingest {
            college_id,
            enrollment_year,
            department,
            college_token,
            date,
            meal_type,
            missed,
            timestamp,
            college_system,
        } => {
            let college_token =
                college_token.unwrap_or_else(|| pulse.mint_college_token(&college_id));
            let outcome = pulse
                .ingest(IngestRequest {
                    student: StudentKey {
                        college_token,
                        college_id,
                        enrollment_year,
                        department,
                    },
                    meal_data: MealInput {
                        date,
                        meal_type,
                        attended: !missed,
                        timestamp,
                    },
                    source: SourceInput {
                        college_system,
                        sync_timestamp: None,
                    },
                })
                .await?;
            print_json(&outcome)?;
        }
        Commands::Analyze { student } => {
            let analysis = pulse.analyze(&student).await;
            print_json(&analysis)?;
        }
        Commands::Report { student, out } => {
            let pattern_report = pulse.pattern_report(&student).await?;
            std::fs::write(&out, report::build_report(&pattern_report))
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Privacy {
            student,
            opt_out,
            allow_check_ins,
            retention_days,
        } => {
            let settings = pulse
                .update_privacy(
                    &student,
                    &PrivacyUpdate {
                        opt_out,
                        allow_check_ins,
                        data_retention_days: retention_days,
                    },
                )
                .await?;
            print_json(&settings)?;
        }
        Commands::Respond {
            student,
            check_in,
            response,
            text,
        } => {
            let outcome = pulse.respond(&student, check_in, response, text).await?;
            print_json(&outcome)?;
        }
        Commands::Purge => {
            let purged = pulse.purge().await?;
            print_json(&purged)?;
        }
    }

    Ok(())
}
