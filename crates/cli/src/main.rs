use anyhow::{Context, Result};
use clap::Parser;
use jobs::{Config, Dispatcher, InvocationId, Ledger, Outcome, SshProbe};
use remote::Program;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use store::Datastore;
use tracing::{debug, error, info, warn};

mod control;
mod logging;

use control::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let argv: Vec<String> = std::env::args().collect();
    let invoked_as = argv.first().cloned().unwrap_or_default();

    let mut config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ffmpegof: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    if is_engine_invocation(&invoked_as) {
        logging::init(&config.program);
        let args = argv.get(1..).unwrap_or_default().to_vec();
        return match run_engine(Arc::new(config), &invoked_as, args).await {
            Ok(code) => exit_code(code),
            Err(err) => {
                error!("{err:#}");
                ExitCode::FAILURE
            }
        };
    }

    let cli = Cli::parse_from(argv);
    if cli.verbose {
        config.program.debug = true;
    }
    logging::init(&config.program);

    let result = async {
        let ledger = open_ledger(&config.database.path)?;
        control::run(cli.command, ledger).await
    }
    .await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Symlinked as `ffmpeg` or `ffprobe`, the binary dispatches jobs instead of
/// acting as the control CLI.
fn is_engine_invocation(invoked_as: &str) -> bool {
    let name = Path::new(invoked_as)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (name.contains("ffmpeg") && !name.contains("ffmpegof")) || name.contains("ffprobe")
}

fn load_config() -> Result<Config> {
    let dir = std::env::var_os(jobs::config::CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(jobs::config::DEFAULT_CONFIG_DIR));
    Config::load(&dir).with_context(|| format!("failed to load configuration from {}", dir.display()))
}

fn open_ledger(path: &Path) -> Result<Ledger> {
    let store = Datastore::open_or_create(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    match store.version() {
        Ok(version) => info!("Using {}", version),
        Err(err) => warn!("Failed to read database version: {err:#}"),
    }
    Ok(Ledger::new(Arc::new(store)))
}

/// A job is never refused over bookkeeping. When the database is unusable
/// an empty in-memory store stands in, so the job runs locally and nothing
/// is recorded.
fn open_engine_ledger(path: &Path) -> Result<Ledger> {
    match open_ledger(path) {
        Ok(ledger) => Ok(ledger),
        Err(err) => {
            warn!("{err:#}; running locally without bookkeeping");
            let store = Datastore::open_in_memory().context("failed to open in-memory database")?;
            Ok(Ledger::new(Arc::new(store)))
        }
    }
}

async fn run_engine(config: Arc<Config>, invoked_as: &str, args: Vec<String>) -> Result<i32> {
    match config.to_yaml() {
        Ok(dump) => debug!("Effective configuration:\n{}", dump),
        Err(err) => warn!("Failed to render configuration: {err}"),
    }
    let ledger = open_engine_ledger(&config.database.path)?;
    let probe = Arc::new(SshProbe::from_config(&config));
    let invocation = InvocationId::new();
    let program = Program::from_invocation(invoked_as);
    info!(
        invocation = %invocation,
        pid = std::process::id(),
        "Starting {} with {} arguments",
        program.name(),
        args.len()
    );

    let dispatcher = Dispatcher::new(config, ledger, probe, invocation);
    let outcome = dispatcher.run(program, args).await;
    if let Outcome::Failed(err) = &outcome {
        error!("{} failed: {err}", program.name());
    }
    Ok(outcome.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unusable_database_falls_back_to_memory() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let path = blocker.path().join("db.sqlite");
        assert!(open_ledger(&path).is_err());

        let ledger = open_engine_ledger(&path).unwrap();
        assert!(ledger.store().path().is_none());
    }

    #[tokio::test]
    async fn test_job_runs_when_database_is_unusable() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.database.path = blocker.path().join("db.sqlite");
        config.commands.fallback_ffmpeg = "/bin/sh".to_string();

        let code = run_engine(
            Arc::new(config),
            "/usr/local/bin/ffmpeg",
            vec!["-c".to_string(), "exit 3".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_engine_invocation_names() {
        assert!(is_engine_invocation("/usr/local/bin/ffmpeg"));
        assert!(is_engine_invocation("ffprobe"));
        assert!(is_engine_invocation("/opt/jellyfin/ffprobe"));
        assert!(!is_engine_invocation("/usr/bin/ffmpegof"));
        assert!(!is_engine_invocation("ffmpegof"));
        assert!(!is_engine_invocation(""));
    }
}
