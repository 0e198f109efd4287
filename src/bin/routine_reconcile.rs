#![forbid(unsafe_code)]

//! Walks every stored video and reconciles it until the provider reports no
//! more comments. Meant to run from cron; one failing video does not stop the
//! run.

use anyhow::{Result, anyhow, bail};
use commentvault_tools::{
    ImportPipeline,
    config::{RuntimeOverrides, resolve_runtime_config},
    logging::init_tracing,
};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

const DEFAULT_MAX_ROUNDS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RoutineArgs {
    database_path: Option<PathBuf>,
    max_rounds: usize,
}

impl RoutineArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut database_path: Option<PathBuf> = None;
        let mut max_rounds = DEFAULT_MAX_ROUNDS;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--database=") {
                database_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--max-rounds=") {
                max_rounds = parse_rounds(value)?;
                continue;
            }

            match arg.as_str() {
                "--database" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--database requires a value"))?;
                    database_path = Some(PathBuf::from(value));
                }
                "--max-rounds" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--max-rounds requires a value"))?;
                    max_rounds = parse_rounds(&value)?;
                }
                _ => {
                    bail!("unknown argument: {arg}");
                }
            }
        }

        Ok(Self {
            database_path,
            max_rounds,
        })
    }
}

fn parse_rounds(value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(0) | Err(_) => bail!("--max-rounds expects a positive integer, got {value:?}"),
        Ok(rounds) => Ok(rounds),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RunSummary {
    videos: usize,
    failed: usize,
    imported: u64,
    incomplete: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let RoutineArgs {
        database_path,
        max_rounds,
    } = RoutineArgs::parse()?;

    let config = resolve_runtime_config(RuntimeOverrides {
        database_path,
        ..RuntimeOverrides::default()
    })?;
    let pipeline = ImportPipeline::from_config(&config).await?;

    let summary = reconcile_all(&pipeline, max_rounds).await?;
    info!(
        videos = summary.videos,
        failed = summary.failed,
        imported = summary.imported,
        incomplete = summary.incomplete,
        "routine reconciliation finished"
    );
    if summary.failed > 0 {
        bail!("{} of {} video(s) failed to reconcile", summary.failed, summary.videos);
    }
    Ok(())
}

async fn reconcile_all(pipeline: &ImportPipeline, max_rounds: usize) -> Result<RunSummary> {
    let videos = pipeline.store().list_videos().await?;
    let mut summary = RunSummary {
        videos: videos.len(),
        ..RunSummary::default()
    };

    for (index, video) in videos.iter().enumerate() {
        info!(
            video_id = %video.id,
            position = index + 1,
            total = videos.len(),
            "reconciling video"
        );
        match pipeline.reconcile_until_complete(&video.id, max_rounds).await {
            Ok(reports) => {
                summary.imported += reports.iter().map(|report| report.imported_count).sum::<u64>();
                if reports.last().is_some_and(|report| report.has_more) {
                    summary.incomplete += 1;
                    warn!(video_id = %video.id, max_rounds, "round limit reached with comments left");
                }
            }
            Err(err) => {
                summary.failed += 1;
                warn!(video_id = %video.id, error = %err, retryable = err.is_retryable(), "reconciliation failed");
            }
        }
    }
    Ok(summary)
}
