#![forbid(unsafe_code)]

//! Command-line front end for the import pipeline.
//!
//! `prepare` only stages an import, and the staging cache lives in this
//! process, so `import` runs prepare and confirm back to back.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use commentvault_tools::{
    ImportPipeline,
    config::{RuntimeOverrides, resolve_runtime_config},
    logging::init_tracing,
    metadata::TagId,
};
use serde::Serialize;
use tracing::{debug, info};

const DEFAULT_RECONCILE_ROUNDS: usize = 50;

#[derive(Parser)]
#[command(name = "import_video")]
#[command(about = "Import and reconcile video comments")]
struct Cli {
    /// SQLite database file (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Alternate .env file
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    /// Pipeline settings TOML (overrides PIPELINE_SETTINGS)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch metadata for a URL or id and show what an import would do
    Prepare { source: String },
    /// Prepare and confirm in one go
    Import {
        source: String,
        /// Catalog tag id; required when the channel is new
        #[arg(long = "tag")]
        tags: Vec<i64>,
    },
    /// Fetch comments newer or older than what is stored
    Reconcile {
        video_id: String,
        /// Keep going while the provider reports more
        #[arg(long)]
        until_complete: bool,
        #[arg(long, default_value_t = DEFAULT_RECONCILE_ROUNDS)]
        max_rounds: usize,
    },
    /// Manage the tag catalog
    Tags {
        #[command(subcommand)]
        action: TagCommands,
    },
}

#[derive(Subcommand)]
enum TagCommands {
    List,
    Add { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = resolve_runtime_config(RuntimeOverrides {
        database_path: cli.database.clone(),
        settings_path: cli.settings.clone(),
        env_path: cli.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let pipeline = ImportPipeline::from_config(&config).await?;
    run(&pipeline, cli.command).await
}

async fn run(pipeline: &ImportPipeline, command: Commands) -> Result<()> {
    match command {
        Commands::Prepare { source } => {
            let prepared = pipeline.prepare(&source).await?;
            print_json(&prepared)?;
        }
        Commands::Import { source, tags } => {
            let tags: Vec<TagId> = tags.into_iter().map(TagId).collect();
            let prepared = pipeline.prepare(&source).await?;
            if prepared.requires_tags && tags.is_empty() {
                let released = pipeline.cancel(prepared.import_id);
                debug!(import_id = %prepared.import_id, released, "released staged import");
                bail!(
                    "channel {} is new; pass at least one --tag (see `tags list`)",
                    prepared.channel_id.as_deref().unwrap_or("?")
                );
            }
            let stats = pipeline
                .confirm(prepared.import_id, &tags)
                .await
                .with_context(|| format!("confirming import of {}", prepared.video_id))?;
            print_json(&stats)?;
        }
        Commands::Reconcile {
            video_id,
            until_complete,
            max_rounds,
        } => {
            if until_complete {
                let reports = pipeline
                    .reconcile_until_complete(&video_id, max_rounds)
                    .await?;
                info!(video_id = %video_id, rounds = reports.len(), "reconciliation finished");
                print_json(&reports)?;
            } else {
                print_json(&pipeline.reconcile(&video_id).await?)?;
            }
        }
        Commands::Tags { action } => match action {
            TagCommands::List => print_json(&pipeline.store().list_tags().await?)?,
            TagCommands::Add { name } => {
                let id = pipeline.store().create_tag(&name).await?;
                print_json(&serde_json::json!({ "id": id, "name": name.trim() }))?;
            }
        },
    }
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
