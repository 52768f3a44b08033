use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scp_sync::config::{Settings, find_root};
use scp_sync::process::SystemRunner;
use scp_sync::progress::StatusLine;
use scp_sync::{ConnectionRegistry, SyncCommands};

/// Mirror local folders to remote hosts over SCP/SSH.
#[derive(Parser, Debug)]
#[command(name = "scp-sync", version, about, long_about = None)]
struct Cli {
    /// Log debug output (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file to use instead of the user config.
    #[arg(long, global = true, env = "SCP_SYNC_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a `.scp` mapping template into DIR.
    Map { dir: PathBuf },
    /// Connect the mapped folders of PATHS.
    Connect {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Upload files and folders.
    Put {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Download files and folders.
    Get {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Remove remote files and folders.
    Rm {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Create remote folders.
    Mkdir {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List a remote folder.
    Ls { path: PathBuf },
    /// Rename a remote file or folder.
    Mv { from: PathBuf, to: PathBuf },
    /// Upload a file after it was saved (honours `auto_upload`).
    Save { path: PathBuf },
}

impl Command {
    fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Map { dir } => vec![dir.as_path()],
            Self::Connect { paths }
            | Self::Put { paths }
            | Self::Get { paths }
            | Self::Rm { paths }
            | Self::Mkdir { paths } => paths.iter().map(PathBuf::as_path).collect(),
            Self::Ls { path } | Self::Save { path } => vec![path.as_path()],
            Self::Mv { from, to } => vec![from.as_path(), to.as_path()],
        }
    }
}

fn abs(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}

fn absolute(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|path| abs(path)).collect()
}

fn main() -> Result<ExitCode> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let status = Arc::new(StatusLine::new());
    let log_writer = status.log_writer();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || log_writer.clone())
        .compact()
        .with_target(false)
        .init();

    run(cli, status)
}

fn run(cli: Cli, status: Arc<StatusLine>) -> Result<ExitCode> {
    let settings = match &cli.settings {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("loading settings")?;

    let registry = ConnectionRegistry::start(settings, Arc::new(SystemRunner::new()), status.clone())
        .context("starting task queue")?;
    let commands = SyncCommands::new(Arc::new(registry));

    if !matches!(cli.command, Command::Map { .. }) {
        commands.registry().settings().check_programs();
        // `connect` reports its own status; other commands connect quietly
        // and leave the cause of a failed handshake in the log.
        if !matches!(cli.command, Command::Connect { .. }) {
            for path in cli.command.paths() {
                let path = abs(path)?;
                if let Some(root) = find_root(&path)
                    && let Err(e) = commands.registry().try_connect(&path)
                {
                    tracing::warn!(root = %root.display(), error = %e, "could not connect");
                }
            }
        }
    }

    match &cli.command {
        Command::Map { dir } => {
            // Failures are reported through the status line.
            let _ = commands.map_to_remote(&abs(dir)?);
        }
        Command::Connect { paths } => {
            commands.connect(&absolute(paths)?);
        }
        Command::Put { paths } => commands.put(&absolute(paths)?),
        Command::Get { paths } => commands.get(&absolute(paths)?),
        Command::Rm { paths } => commands.delete(&absolute(paths)?),
        Command::Mkdir { paths } => commands.mkdir(&absolute(paths)?),
        Command::Ls { path } => commands.list(&abs(path)?),
        Command::Mv { from, to } => commands.rename(&abs(from)?, &abs(to)?),
        Command::Save { path } => {
            let path = abs(path)?;
            if !commands.on_post_save(&path) {
                tracing::info!(path = %path.display(), "nothing to upload");
            }
        }
    }

    commands.registry().queue().wait_idle();
    status.finish();
    commands.registry().shutdown();

    Ok(if status.failures() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
