use std::path::Path;

use anyhow::Result;
use ledgerview_core::handler::Status;

use super::Workspace;
use crate::output::{render, table_header, OutputMode};

/// Execute `lv status`: checkpoint, head and lag per projection and tenant.
///
/// # Errors
///
/// Returns an error if a database cannot be read.
pub fn run_status(config_path: Option<&Path>, output: OutputMode) -> Result<()> {
    let ws = Workspace::open(config_path)?;
    let mut statuses: Vec<Status> = Vec::new();
    for worker in &ws.workers {
        statuses.extend(worker.statuses(&ws.conn)?);
    }

    render(output, &statuses, |items, w| {
        if items.is_empty() {
            return writeln!(w, "no tenants with events yet");
        }
        table_header(
            w,
            &format!(
                "{:<32} {:<20} {:>9} {:>9} {:>6}",
                "PROJECTION", "INSTANCE", "POSITION", "HEAD", "LAG"
            ),
        )?;
        for s in items {
            writeln!(
                w,
                "{:<32} {:<20} {:>9} {:>9} {:>6}",
                s.projection, s.instance_id, s.position, s.head, s.lag
            )?;
        }
        Ok(())
    })
}
