#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{render_error, CliError, OutputMode};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "lv: replay an event log into relational read tables",
    long_about = None
)]
struct Cli {
    /// Config file (default: $LEDGERVIEW_CONFIG, then the user config dir).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Create databases and projection tables",
        after_help = "EXAMPLES:\n    # Initialize with the default config\n    lv init\n\n    # Use an explicit config file\n    lv --config ./ledgerview.toml init"
    )]
    Init,

    #[command(
        about = "Append events from a JSON-lines file",
        after_help = "EXAMPLES:\n    # Push fixture events\n    lv push events.jsonl\n\n    # Read commands from stdin\n    cat events.jsonl | lv push -"
    )]
    Push(cmd::push::PushArgs),

    #[command(
        about = "Project events into the read tables",
        after_help = "EXAMPLES:\n    # Catch up once and exit\n    lv run --once\n\n    # Keep polling until stopped\n    lv run"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        about = "Show checkpoints and lag per projection and instance",
        after_help = "EXAMPLES:\n    lv status\n    lv status --json"
    )]
    Status,

    #[command(
        about = "List events that failed to project",
        after_help = "EXAMPLES:\n    lv failed --json"
    )]
    Failed,

    #[command(
        about = "Drop a projection's rows and checkpoints for a replay",
        after_help = "EXAMPLES:\n    # Replay one projection for every instance\n    lv reset org_members2\n\n    # Only one instance\n    lv reset projections.org_members2 --instance inst-1"
    )]
    Reset(cmd::reset::ResetArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LEDGERVIEW_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "ledgerview_core=debug,ledgerview_iam=debug,ledgerview_cli=debug,info"
        } else {
            "ledgerview_core=info,ledgerview_iam=info,ledgerview_cli=info,warn"
        })
    });

    let format = env::var("LEDGERVIEW_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let output = cli.output_mode();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Init => cmd::init::run_init(config, output),
        Commands::Push(ref args) => cmd::push::run_push(args, config, output),
        Commands::Run(ref args) => cmd::run::run_run(args, config, output),
        Commands::Status => cmd::status::run_status(config, output),
        Commands::Failed => cmd::failed::run_failed(config, output),
        Commands::Reset(ref args) => cmd::reset::run_reset(args, config, output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if render_error(output, &CliError::from(&err)).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
