use std::path::Path;

use anyhow::{Context as _, Result};
use clap::Args;
use ledgerview_core::runner::Runner;
use ledgerview_core::Shutdown;
use serde::Serialize;
use tracing::{error, info};

use super::{open_projection_db, Workspace};
use crate::output::{render, table_header, OutputMode};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Catch every projection up once and exit instead of polling.
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Serialize)]
struct Outcome {
    projection: String,
    applied: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
}

/// Execute `lv run`.
///
/// With `--once` every projection is triggered for every known tenant on
/// this process's connection. Otherwise each projection gets its own thread
/// and connection and polls until the process is stopped.
///
/// # Errors
///
/// Returns an error if setup fails or any projection failed.
pub fn run_run(args: &RunArgs, config_path: Option<&Path>, output: OutputMode) -> Result<()> {
    let mut ws = Workspace::open(config_path)?;
    if !args.once {
        return run_forever(ws);
    }

    let shutdown = Shutdown::new();
    let mut outcomes = Vec::with_capacity(ws.workers.len());
    for worker in &ws.workers {
        let outcome = match worker.trigger_known(&mut ws.conn, &shutdown) {
            Ok(applied) => Outcome {
                projection: worker.name().to_owned(),
                applied,
                error: None,
                error_code: None,
            },
            Err(err) => {
                error!(projection = %worker.name(), error = %err, code = %err.code(), "trigger failed");
                Outcome {
                    projection: worker.name().to_owned(),
                    applied: 0,
                    error: Some(err.to_string()),
                    error_code: Some(err.code().code().to_owned()),
                }
            }
        };
        outcomes.push(outcome);
    }

    render(output, &outcomes, |items, w| {
        table_header(w, &format!("{:<32} {:>8}  ERROR", "PROJECTION", "APPLIED"))?;
        for item in items {
            writeln!(
                w,
                "{:<32} {:>8}  {}",
                item.projection,
                item.applied,
                item.error.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    })?;

    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{failed} projection(s) failed");
    }
    Ok(())
}

fn run_forever(ws: Workspace) -> Result<()> {
    let Workspace { config, conn, workers, .. } = ws;
    drop(conn);
    info!(projections = workers.len(), "starting projection runner");
    let runner = Runner::spawn(workers, || open_projection_db(&config), Shutdown::new())
        .context("start projection runner")?;

    let mut halted = 0;
    for (projection, outcome) in runner.join() {
        if let Err(err) = outcome {
            error!(%projection, error = %err, code = %err.code(), "projection halted");
            halted += 1;
        }
    }
    if halted > 0 {
        anyhow::bail!("{halted} projection(s) halted");
    }
    Ok(())
}
