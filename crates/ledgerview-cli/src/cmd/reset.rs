use std::path::Path;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use super::Workspace;
use crate::output::{render, OutputMode};

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Projection name, with or without the `projections.` prefix.
    #[arg(value_name = "PROJECTION")]
    pub projection: String,

    /// Only reset this tenant.
    #[arg(long, value_name = "ID")]
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResetReport {
    projection: String,
    instance_id: Option<String>,
    rows_deleted: usize,
}

/// Execute `lv reset`: drop a projection's rows, checkpoints and failures so
/// the next run replays it from the first event.
///
/// # Errors
///
/// Returns an error for an unknown projection or if the reset fails.
pub fn run_reset(args: &ResetArgs, config_path: Option<&Path>, output: OutputMode) -> Result<()> {
    let mut ws = Workspace::open(config_path)?;
    let Some(worker) = ws.worker(&args.projection).cloned() else {
        let known: Vec<&str> = ws.workers.iter().map(|w| w.name()).collect();
        anyhow::bail!(
            "unknown projection '{}' (known: {})",
            args.projection,
            known.join(", ")
        );
    };
    let rows_deleted = worker.reset(&mut ws.conn, args.instance.as_deref())?;
    let report = ResetReport {
        projection: worker.name().to_owned(),
        instance_id: args.instance.clone(),
        rows_deleted,
    };
    render(output, &report, |r, w| {
        writeln!(
            w,
            "reset {} for {}: {} rows deleted",
            r.projection,
            r.instance_id.as_deref().unwrap_or("all instances"),
            r.rows_deleted
        )
    })
}
