use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Args;
use ledgerview_core::config::load_config;
use ledgerview_core::eventstore::{Command, EventStore};
use serde::Serialize;
use tracing::info;

use super::open_store;
use crate::output::{render, OutputMode};

#[derive(Args, Debug)]
pub struct PushArgs {
    /// JSON-lines file of commands, `-` for stdin.
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

#[derive(Debug, Serialize)]
struct PushReport {
    pushed: usize,
    last_position: Option<u64>,
}

/// Parse one command per non-empty line. Lines starting with `#` are skipped.
fn parse_commands(reader: impl BufRead) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("read command line")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let command: Command = serde_json::from_str(trimmed)
            .with_context(|| format!("line {}: invalid command", index + 1))?;
        commands.push(command);
    }
    Ok(commands)
}

/// Execute `lv push`: append every command in the file in one transaction.
///
/// # Errors
///
/// Returns an error if the file cannot be read, a line is not a valid
/// command, or the event store rejects the batch.
pub fn run_push(args: &PushArgs, config_path: Option<&Path>, output: OutputMode) -> Result<()> {
    let commands = if args.file.as_os_str() == "-" {
        parse_commands(io::stdin().lock())?
    } else {
        let file = File::open(&args.file)
            .with_context(|| format!("open {}", args.file.display()))?;
        parse_commands(BufReader::new(file))?
    };

    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let pushed = if commands.is_empty() {
        Vec::new()
    } else {
        store.push(commands).context("push commands")?
    };
    let report = PushReport {
        pushed: pushed.len(),
        last_position: pushed.last().map(|event| event.base.position),
    };
    info!(pushed = report.pushed, last_position = ?report.last_position, "events pushed");

    render(output, &report, |r, w| match r.last_position {
        Some(position) => writeln!(w, "pushed {} events, last position {position}", r.pushed),
        None => writeln!(w, "nothing to push"),
    })
}
