//! ptyhost
//!
//! Runs a program inside a pseudo-terminal and prints what it wrote.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ptyhost::config::Config;
use ptyhost::session::{PtyOptions, SessionManager, SessionManagerImpl, SessionStatus};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// How long to wait for stragglers when tearing the session down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// ptyhost - run programs in pseudo-terminals.
#[derive(Parser, Debug)]
#[command(name = "ptyhost")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a program in a pty and print its output once it exits
    Run {
        /// Run the command line through the configured shell
        #[arg(long)]
        shell: bool,

        /// Working directory for the program
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Extra environment variable (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Kill the program after this many seconds
        #[arg(long, value_name = "SECS")]
        kill_after: Option<u64>,

        /// Print the rendered plain-text view instead of raw output
        #[arg(long)]
        plain: bool,

        /// Print a JSON report with the process info and its output
        #[arg(long)]
        json: bool,

        /// Program to run, followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    // Held until exit so buffered log lines are flushed.
    let _log_guard = init_tracing(&config, cli.verbose)?;

    config.validate()?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            shell,
            cwd,
            env,
            kill_after,
            plain,
            json,
            command,
        } => {
            let (program, args) = command
                .split_first()
                .context("No program given")?;

            let mut options = PtyOptions::new(program.clone())
                .args(args.iter().cloned())
                .shell_mode(shell);
            if let Some(cwd) = cwd {
                options = options.cwd(cwd);
            }
            for (key, value) in env {
                options = options.env(key, value);
            }

            let report = if json {
                Report::Json
            } else if plain {
                Report::Plain
            } else {
                Report::Raw
            };
            let code = run(&config, options, kill_after.map(Duration::from_secs), report).await?;
            Ok(ExitCode::from(exit_status(code)))
        }
    }
}

fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { config.log.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.log.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let prefix = path
                .file_name()
                .context("log.file must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// What `run` prints once the program has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Report {
    Raw,
    Plain,
    Json,
}

async fn run(
    config: &Config,
    options: PtyOptions,
    kill_after: Option<Duration>,
    report: Report,
) -> anyhow::Result<Option<i32>> {
    let manager = SessionManagerImpl::from_config(config);
    let session_id = manager.create_session()?;
    manager.update_status(&session_id, SessionStatus::Active)?;

    let pty_id = manager.create_pty(&session_id, options)?;
    let pty = manager.get_pty(&session_id, &pty_id)?;
    tracing::info!(session_id = %session_id, pty_id = %pty_id, pid = ?pty.pid(), "Program started");

    let code = match kill_after {
        Some(delay) => {
            tokio::select! {
                code = pty.wait_for_exit() => code,
                _ = tokio::time::sleep(delay) => {
                    tracing::info!(pty_id = %pty_id, "Kill timer elapsed");
                    pty.kill();
                    pty.wait_for_exit().await
                }
            }
        }
        None => pty.wait_for_exit().await,
    };

    match report {
        Report::Raw => print!("{}", pty.get_output_buffer(false)),
        Report::Plain => {
            let output = pty.get_output_buffer(true);
            print!("{output}");
            if !output.is_empty() && !output.ends_with('\n') {
                println!();
            }
        }
        Report::Json => {
            let report = serde_json::json!({
                "session_id": session_id,
                "pty": pty.info(),
                "output": pty.get_output_buffer(true),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    manager.update_status(&session_id, SessionStatus::Terminated)?;
    let stragglers = manager.shutdown_and_wait(SHUTDOWN_TIMEOUT).await;
    if stragglers > 0 {
        tracing::warn!(count = stragglers, "Processes still running at exit");
    }

    Ok(code)
}

/// Maps the child's exit code onto this process's exit status.
fn exit_status(code: Option<i32>) -> u8 {
    match code {
        Some(code) => u8::try_from(code).unwrap_or(1),
        // The child could not be reaped.
        None => 125,
    }
}
