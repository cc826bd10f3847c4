use chrono::Local;
use jobs::config::ProgramConfig;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// `ffmpegof_YYYYMMDD.log` inside `dir`, for today.
pub fn log_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("ffmpegof_{}.log", Local::now().format("%Y%m%d")))
}

fn open_log_file(dir: &Path) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(dir))
}

/// Log to stderr and to the daily file. `RUST_LOG` overrides the level.
pub fn init(program: &ProgramConfig) {
    let default_level = if program.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file, file_error) = match open_log_file(&program.log) {
        Ok(file) => (Some(file), None),
        Err(err) => (None, Some(err)),
    };
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init();

    if let Some(err) = file_error {
        tracing::warn!(dir = %program.log.display(), error = %err, "log file unavailable, logging to stderr only");
    }
}
