use std::path::Path;

use anyhow::Result;
use ledgerview_core::handler::FailedEvent;

use super::Workspace;
use crate::output::{render, table_header, OutputMode};

/// Execute `lv failed`: events that failed to project, with their counts.
///
/// # Errors
///
/// Returns an error if the projection database cannot be read.
pub fn run_failed(config_path: Option<&Path>, output: OutputMode) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let mut failed: Vec<FailedEvent> = Vec::new();
    for worker in &ws.workers {
        failed.extend(worker.failed_events(&ws.conn)?);
    }

    render(output, &failed, |items, w| {
        if items.is_empty() {
            return writeln!(w, "no failed events");
        }
        table_header(w, "PROJECTION / INSTANCE / AGGREGATE@SEQUENCE  FAILURES")?;
        for f in items {
            writeln!(
                w,
                "{} / {} / {}:{}@{}  x{}\n    {}",
                f.projection_name,
                f.instance_id,
                f.aggregate_type,
                f.aggregate_id,
                f.event_sequence,
                f.failure_count,
                f.error
            )?;
        }
        Ok(())
    })
}
