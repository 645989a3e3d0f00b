//! Shared output layer: every command renders either human text or JSON.
//!
//! JSON goes to stdout as one pretty-printed document per command; errors go
//! to stderr in the same mode so scripts can parse both.

use ledgerview_core::ProjectionError;
use serde::Serialize;
use std::io::{self, Write};

/// Width of the separator under table headers.
pub const RULE_WIDTH: usize = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Write a header row followed by a rule.
pub fn table_header(w: &mut dyn Write, header: &str) -> io::Result<()> {
    writeln!(w, "{header}")?;
    writeln!(w, "{:-<width$}", "", width = RULE_WIDTH)
}

/// Render a serializable value to stdout in the requested format.
///
/// In JSON mode the value is serialized with `serde_json`; otherwise
/// `human_fn` writes the text form.
pub fn render<T: Serialize + ?Sized>(
    mode: OutputMode,
    value: &T,
    human_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Human => human_fn(value, &mut out)?,
    }
    Ok(())
}

/// A structured error with optional hint and error code.
#[derive(Debug, Serialize)]
pub struct CliError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// `E####` code when the failure came from the projection engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CliError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
            error_code: None,
        }
    }
}

impl From<&ProjectionError> for CliError {
    fn from(err: &ProjectionError) -> Self {
        let code = err.code();
        Self {
            message: err.to_string(),
            hint: code.hint().map(str::to_owned),
            error_code: Some(code.code().to_owned()),
        }
    }
}

impl From<&anyhow::Error> for CliError {
    fn from(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<ProjectionError>())
            .map_or_else(|| Self::new(format!("{err:#}")), |projection| {
                let mut cli = Self::from(projection);
                cli.message = format!("{err:#}");
                cli
            })
    }
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({ "error": error });
            serde_json::to_writer_pretty(&mut out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Human => {
            match &error.error_code {
                Some(code) => writeln!(out, "error[{code}]: {}", error.message)?,
                None => writeln!(out, "error: {}", error.message)?,
            }
            if let Some(hint) = &error.hint {
                writeln!(out, "  hint: {hint}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn projection_errors_carry_code_and_hint() {
        let err = ProjectionError::Cancelled;
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E7001"));
        assert!(cli.hint.is_none());

        let err = ProjectionError::Timeout(std::time::Duration::from_secs(1));
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E6002"));
        assert!(cli.hint.unwrap().contains("bulk_limit"));
    }

    #[test]
    fn anyhow_context_keeps_the_engine_code() {
        let err: anyhow::Result<()> = Err(ProjectionError::Cancelled).context("run projections");
        let cli = CliError::from(&err.unwrap_err());
        assert_eq!(cli.error_code.as_deref(), Some("E7001"));
        assert!(cli.message.starts_with("run projections: "), "{}", cli.message);
    }

    #[test]
    fn plain_errors_have_no_code() {
        let cli = CliError::from(&anyhow::anyhow!("boom"));
        assert_eq!(cli.message, "boom");
        assert!(cli.error_code.is_none());
        let json = serde_json::to_value(&cli).unwrap();
        assert_eq!(json, serde_json::json!({ "message": "boom" }));
    }
}
