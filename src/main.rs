use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use vigild::config::Settings;
use vigild::daemon::{Daemon, RunOutcome};
use vigild::handler::{HandlerRegistry, register_builtins};

/// Monitor system event notifications and dispatch them to configured
/// handlers.
#[derive(Parser)]
#[command(name = "vigild", version, about)]
struct Cli {
    /// Use an alternate configuration file
    #[arg(short = 'f', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the configuration, resolve every handler, and exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match cli.config.clone().or_else(default_config_path) {
        Some(path) => path,
        None => {
            eprintln!("vigild: cannot determine a configuration directory; pass --config");
            return ExitCode::FAILURE;
        }
    };

    if !config_path.exists() {
        return match Settings::write_example(&config_path) {
            Ok(()) => {
                eprintln!(
                    "vigild: created {} with example settings for you to customize",
                    config_path.display()
                );
                ExitCode::FAILURE
            }
            Err(err) => {
                eprintln!("vigild: {err}");
                ExitCode::FAILURE
            }
        };
    }

    // The worker is rebuilt from scratch on every restart request, so
    // configuration and code changes always take effect from a cold start.
    loop {
        match run_once(&config_path, cli.check) {
            Ok(Some(reason)) => {
                tracing::info!("[daemon] reloading: {reason}");
            }
            Ok(None) => return ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("vigild: {err:#}");
                return ExitCode::FAILURE;
            }
        }
    }
}

/// Build and run one worker instance. Returns the restart reason when the
/// loop should go around again, `None` on a normal exit.
fn run_once(config_path: &Path, check: bool) -> anyhow::Result<Option<String>> {
    let settings = Settings::load_from(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    vigild::logging::init_with_config(&settings.logging);
    tracing::info!("[daemon] loaded configuration from {}", config_path.display());

    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry);

    let mut daemon = Daemon::builder()
        .settings(settings)
        .registry(registry)
        .config_path(config_path.to_path_buf())
        .build();

    if check {
        daemon.check()?;
        println!("configuration OK");
        return Ok(None);
    }

    daemon.start()?;
    match daemon.run() {
        RunOutcome::Interrupted => Ok(None),
        RunOutcome::Restart(reason) => Ok(Some(reason)),
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vigild").join("config.toml"))
}
