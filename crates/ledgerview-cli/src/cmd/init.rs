use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use super::Workspace;
use crate::output::{render, OutputMode};

#[derive(Debug, Serialize)]
struct InitReport {
    eventstore: String,
    projections: String,
    initialized: Vec<String>,
}

/// Execute `lv init`: create both databases, migrate the engine tables and
/// apply every projection's table check.
///
/// # Errors
///
/// Returns an error if a database cannot be opened or a schema check fails.
pub fn run_init(config_path: Option<&Path>, output: OutputMode) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let report = InitReport {
        eventstore: ws.config.database.eventstore_path.display().to_string(),
        projections: ws.config.database.projections_path.display().to_string(),
        initialized: ws.workers.iter().map(|w| w.name().to_owned()).collect(),
    };
    render(output, &report, |r, w| {
        writeln!(w, "event store:  {}", r.eventstore)?;
        writeln!(w, "projections:  {}", r.projections)?;
        for name in &r.initialized {
            writeln!(w, "  initialized {name}")?;
        }
        Ok(())
    })
}
