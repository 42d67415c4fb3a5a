use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{DetectedRegion, PresenceDetector};
use facegate_directory::FaceDirectory;
use facegate_engine::{
    Config, IdentificationEngine, IdentityStore, PersonProfile, PipelineOutcome, Reception,
    SqliteIdentityStore,
};
use serde_json::json;

#[derive(Parser)]
#[command(name = "facegate", about = "Face identification and enrollment for reception desks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify a visitor and look them up in the identity store
    Scan {
        /// Image file to scan
        image: PathBuf,
    },
    /// Run the identification pipeline only and print the raw outcome
    Identify {
        image: PathBuf,
    },
    /// Register a new person and enroll their face
    Register {
        image: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Employee number (must be unique)
        #[arg(long)]
        number: i64,
        #[arg(long)]
        position: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Run local face detection only (no remote calls)
    Detect {
        image: PathBuf,
    },
    /// Resolve (creating if needed) the remote face collection
    Directory,
    /// Show a stored person
    Show {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Scan { image } => {
            let reception = reception(&config).await?;
            let result = reception.scan(read_image(&image).await?).await?;
            print_json(&serde_json::to_value(&result)?)?;
        }
        Commands::Identify { image } => {
            let engine = engine(&config)?;
            let outcome = engine.identify(read_image(&image).await?).await;
            print_json(&outcome_json(&outcome))?;
            if let PipelineOutcome::Error(err) = outcome {
                return Err(err.into());
            }
        }
        Commands::Register {
            image,
            name,
            email,
            number,
            position,
            department,
            phone,
        } => {
            let reception = reception(&config).await?;
            let profile = PersonProfile {
                name,
                email,
                employee_number: number,
                position,
                department,
                phone_number: phone,
            };
            let person = reception
                .register(profile, read_image(&image).await?)
                .await
                .context("registration failed")?;
            print_json(&serde_json::to_value(&person)?)?;
        }
        Commands::Detect { image } => {
            let detector = Arc::new(config.load_detector()?);
            let bytes = read_image(&image).await?;
            let regions = tokio::task::spawn_blocking(move || detector.detect(&bytes)).await?;
            let policy = config.policy();
            print_json(&json!({
                "faces": regions,
                "largest": DetectedRegion::largest(&regions),
                "gate": match policy.gate(&regions) {
                    Ok(_) => "pass".to_string(),
                    Err(reason) => reason.to_string(),
                },
            }))?;
        }
        Commands::Directory => {
            let directory = config.build_directory()?;
            let handle = directory.ensure_directory().await?;
            print_json(&json!({ "directory": handle }))?;
        }
        Commands::Show { id } => {
            let store = SqliteIdentityStore::open(&config.db_path).await?;
            match store.get(&id).await? {
                Some(person) => print_json(&serde_json::to_value(&person)?)?,
                None => bail!("no person with id {id}"),
            }
        }
    }

    Ok(())
}

fn engine(config: &Config) -> Result<IdentificationEngine> {
    let detector = config
        .load_detector()
        .context("failed to load face cascade")?;
    let directory = config.build_directory()?;
    Ok(IdentificationEngine::new(
        Arc::new(detector),
        Arc::new(directory),
        config.policy(),
    ))
}

async fn reception(config: &Config) -> Result<Reception> {
    let store = SqliteIdentityStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    Ok(Reception::new(engine(config)?, Arc::new(store)))
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

fn outcome_json(outcome: &PipelineOutcome) -> serde_json::Value {
    match outcome {
        PipelineOutcome::Recognized {
            identity,
            confidence,
            observed_token,
        } => json!({
            "outcome": "recognized",
            "identity": identity,
            "confidence": confidence,
            "token": observed_token,
        }),
        PipelineOutcome::NewPerson { observed_token } => json!({
            "outcome": "new_person",
            "token": observed_token,
        }),
        PipelineOutcome::DetectionFailed { reason } => json!({
            "outcome": "detection_failed",
            "reason": reason,
            "message": reason.message(),
        }),
        PipelineOutcome::Error(err) => json!({
            "outcome": "error",
            "error": err.to_string(),
        }),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
