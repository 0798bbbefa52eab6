use crate::config::config::ScriptboxConfig;
use crate::config::types::{BoundaryKind, RunOutcome, SandboxConfig, SandboxError};
use crate::core::supervisor::Sandbox;
use crate::core::worker::{run_worker_main, WORKER_ROLE};
use crate::transform::Transformer;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit status used when a run hits the wall-clock cutoff
pub const EXIT_TIMEOUT: i32 = 124;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; used by the process boundary re-exec path)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    /// Configuration file (defaults to ./scriptbox.json when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script in a fresh execution context
    Run {
        /// Script file, or `-` for stdin
        file: Option<PathBuf>,
        /// Wall clock budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Isolation boundary (thread or process)
        #[arg(long)]
        boundary: Option<BoundaryKind>,
        /// Print one JSON host event per line
        #[arg(long)]
        json: bool,
        /// Expected output transcript; `\n` separates lines
        #[arg(long, value_name = "TEXT")]
        expect: Option<String>,
        /// Append audit events to this JSON-lines file
        #[arg(long, value_name = "PATH")]
        audit_log: Option<PathBuf>,
    },
    /// Transform a script and print the executable text
    Check {
        /// Script file, or `-` for stdin
        file: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    // Initialize structured logging; stderr only so worker stdout stays protocol-clean
    env_logger::init();

    let cli = Cli::parse();
    if let Some(role) = cli.internal_role.as_deref() {
        if role == WORKER_ROLE {
            return run_worker_main().map_err(Into::into);
        }
        return Err(anyhow::anyhow!("unsupported internal role: {}", role));
    }

    let command = cli
        .command
        .ok_or_else(|| anyhow::anyhow!("missing command"))?;

    match command {
        Commands::Run {
            file,
            timeout_ms,
            boundary,
            json,
            expect,
            audit_log,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(timeout_ms) = timeout_ms {
                config.timeout = Duration::from_millis(timeout_ms);
            }
            if let Some(boundary) = boundary {
                config.boundary = boundary;
            }
            if audit_log.is_some() {
                config.audit_log = audit_log;
            }

            let source = read_source(file.as_deref())?;
            let mut sandbox = Sandbox::new(config)?;
            let report = sandbox.run_to_completion(&source)?;

            for event in &report.events {
                if json {
                    println!("{}", serde_json::to_string(event)?);
                } else if let Some(output) = event.as_output() {
                    println!("{}", output.display_line());
                }
            }
            log::info!(
                "generation {} finished: {} after {} ms",
                report.generation,
                report.outcome,
                report.wall_time_ms
            );

            if report.outcome == RunOutcome::TimedOut {
                std::process::exit(EXIT_TIMEOUT);
            }

            if let Some(expected) = expect {
                let expected = unescape_newlines(&expected);
                if !sandbox.output().matches_expected(&expected) {
                    eprintln!("Error: output does not match the expected transcript");
                    eprintln!("Expected:\n{}", expected);
                    eprintln!("Actual:\n{}", sandbox.output().texts().join("\n"));
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Commands::Check { file } => {
            let source = read_source(file.as_deref())?;
            match Transformer::new().transform(&source) {
                Ok(executable) => {
                    print!("{}", executable);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("❌ {}", SandboxError::from(e));
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Explicit file, then ./scriptbox.json, then built-in defaults
fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let file_config = match path {
        Some(path) => Some(ScriptboxConfig::load_from_file(path)?),
        None => ScriptboxConfig::load_default()?,
    };
    match file_config {
        Some(file_config) => Ok(file_config.into_sandbox_config()?),
        None => Ok(SandboxConfig::default()),
    }
}

fn read_source(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display())),
        _ => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("Failed to read script from stdin")?;
            Ok(source)
        }
    }
}

/// Turns the two-character sequence `\n` into a newline
fn unescape_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
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
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "scriptbox",
            "run",
            "snippet.js",
            "--timeout-ms",
            "250",
            "--boundary",
            "process",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run {
                file,
                timeout_ms,
                boundary,
                json,
                ..
            }) => {
                assert_eq!(file, Some(PathBuf::from("snippet.js")));
                assert_eq!(timeout_ms, Some(250));
                assert_eq!(boundary, Some(BoundaryKind::Process));
                assert!(json);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_internal_role_needs_no_command() {
        let cli = Cli::try_parse_from(["scriptbox", "--internal-role", "worker"]).unwrap();
        assert_eq!(cli.internal_role.as_deref(), Some(WORKER_ROLE));
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_unknown_boundary_rejected() {
        assert!(Cli::try_parse_from(["scriptbox", "run", "--boundary", "vm"]).is_err());
    }

    #[test]
    fn test_unescape_newlines() {
        assert_eq!(unescape_newlines("A\\nB"), "A\nB");
        assert_eq!(unescape_newlines("plain"), "plain");
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(&path, r#"{"sandbox": {"timeout_ms": 750}}"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(750));
        assert_eq!(config.boundary, BoundaryKind::Thread);
    }
}
