//! DeepTree CLI: build reasoning trees for a batch of documents.

mod commands;
mod dry_run;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// DeepTree: search-grounded multi-hop question trees
#[derive(Parser, Debug)]
#[command(name = "deeptree", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds .deeptree/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Directory for the JSON build log (defaults to the user data dir)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build trees for every document in a batch file
    Build(BuildArgs),
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct BuildArgs {
    /// Document batch: {"documents": [...]} or a bare JSON array
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory (defaults to output.dir from the configuration)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum tree depth
    #[arg(long)]
    max_layers: Option<usize>,

    /// Maximum children per node
    #[arg(long)]
    max_children: Option<usize>,

    /// Concurrent masking tests
    #[arg(long)]
    workers: Option<usize>,

    /// Use scripted model and search backends; no network access
    #[arg(long)]
    dry_run: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

/// Console filter for the verbosity flags. `RUST_LOG` wins when set.
fn console_directive(verbose: u8, quiet: bool) -> &'static str {
    match (verbose, quiet) {
        (0, true) => "error",
        (0, false) => "info,deeptree_core::providers=warn",
        (1, _) => "debug",
        _ => "trace",
    }
}

fn default_log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "deeptree", "deeptree")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".deeptree").join("logs"))
}

/// Console output on stderr plus a daily JSON log of every build step.
/// The returned guard flushes the file writer on drop.
fn init_tracing(cli: &Cli) -> WorkerGuard {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directive(cli.verbose, cli.quiet)));
    let console = tracing_subscriber::fmt::layer()
        .with_target(cli.verbose > 1)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let log_dir = cli.log_dir.clone().unwrap_or_else(default_log_dir);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("warning: cannot create log directory {}: {e}", log_dir.display());
    }
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "build.log"));
    let build_log = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(writer)
        .with_filter(EnvFilter::new("deeptree_core=debug,deeptree=debug"));

    tracing_subscriber::registry()
        .with(console)
        .with(build_log)
        .init();
    guard
}

fn resolve_workspace(path: &Path) -> anyhow::Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("Workspace {} is not accessible", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env may carry OPENAI_API_KEY and DEEPTREE_* overrides
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli);
    let workspace = resolve_workspace(&cli.workspace)?;
    commands::handle_command(cli.command, &workspace, cli.quiet).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_flags_parse() {
        let cli = Cli::try_parse_from([
            "deeptree",
            "-vv",
            "build",
            "--input",
            "docs.json",
            "--max-layers",
            "2",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.input, PathBuf::from("docs.json"));
        assert_eq!(args.max_layers, Some(2));
        assert!(args.dry_run);
        assert!(Cli::try_parse_from(["deeptree", "build"]).is_err());
    }

    #[test]
    fn test_console_directive() {
        assert_eq!(console_directive(0, true), "error");
        assert!(console_directive(0, false).starts_with("info"));
        assert_eq!(console_directive(1, true), "debug");
        assert_eq!(console_directive(3, false), "trace");
    }

    #[test]
    fn test_missing_workspace_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(resolve_workspace(&dir.path().join("absent")).is_err());
        assert_eq!(
            resolve_workspace(dir.path()).unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
