use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobs::control::{self, ClearTarget, StatusEntry};
use jobs::{HostRegistry, Ledger};

#[derive(Parser)]
#[command(name = "ffmpegof")]
#[command(about = "Remote ffmpeg dispatcher - manage transcode workers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a worker, or update the one with the same name
    Add {
        /// Hostname or IP address of the worker
        host: String,

        /// Name shown in status output (defaults to the host)
        #[arg(short, long)]
        name: Option<String>,

        /// Relative capacity; a host with weight 2 takes twice the jobs
        #[arg(short, long, default_value_t = 1)]
        weight: u32,
    },

    /// Remove a worker by name
    Remove {
        name: String,
    },

    /// Show workers, their state and the jobs running on them
    Status,

    /// Reset process and state bookkeeping
    Clear {
        /// Only clear the worker with this name
        #[arg(long, conflicts_with = "id")]
        name: Option<String>,

        /// Only clear the worker with this id (0 for local jobs)
        #[arg(long)]
        id: Option<i64>,
    },
}

pub async fn run(command: Commands, ledger: Ledger) -> Result<()> {
    match command {
        Commands::Add { host, name, weight } => {
            let row = HostRegistry::new(ledger)
                .add(&host, name.as_deref(), weight)
                .await
                .with_context(|| format!("failed to add {host}"))?;
            println!("Added {} ({}) with weight {}", row.servername, row.hostname, row.weight);
        }
        Commands::Remove { name } => {
            HostRegistry::new(ledger)
                .remove(&name)
                .await
                .with_context(|| format!("failed to remove {name}"))?;
            println!("Removed {name}");
        }
        Commands::Status => {
            let entries = control::status(&ledger).await?;
            print!("{}", render_status(&entries));
        }
        Commands::Clear { name, id } => {
            let target = match (&name, id) {
                (Some(name), _) => ClearTarget::Name(name),
                (None, Some(id)) => ClearTarget::Id(id),
                (None, None) => ClearTarget::All,
            };
            let report = control::clear(&ledger, target).await?;
            println!(
                "Cleared {} process and {} state entries",
                report.processes, report.states
            );
        }
    }
    Ok(())
}

const HEADERS: [&str; 6] = [
    "Servername",
    "Hostname",
    "ID",
    "Weight",
    "State",
    "Active Commands",
];

/// Fixed-width table; hosts with several jobs span several lines.
pub fn render_status(entries: &[StatusEntry]) -> String {
    let mut rows: Vec<[String; 6]> = Vec::new();
    for entry in entries {
        let mut commands = entry
            .commands
            .iter()
            .map(|c| format!("PID {}: {}", c.process_id, c.cmd));
        rows.push([
            entry.servername.clone(),
            entry.hostname.clone(),
            entry.id.to_string(),
            entry.weight.to_string(),
            entry.state.to_string(),
            commands.next().unwrap_or_else(|| "N/A".to_string()),
        ]);
        for cmd in commands {
            rows.push([
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                cmd,
            ]);
        }
    }

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let header = HEADERS.map(str::to_string);
    let mut out = format!("\x1b[1m{}\x1b[0m\n", format_line(&header, &widths));
    for row in &rows {
        out.push_str(&format_line(row, &widths));
        out.push('\n');
    }
    out
}

fn format_line(cells: &[String; 6], widths: &[usize; 6]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect();
    padded.join("  ").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs::control::ActiveCommand;

    fn entry(servername: &str, state: &'static str, commands: &[(&str, &str)]) -> StatusEntry {
        StatusEntry {
            servername: servername.to_string(),
            hostname: servername.to_string(),
            id: 1,
            weight: 1,
            state,
            commands: commands
                .iter()
                .map(|(pid, cmd)| ActiveCommand {
                    process_id: pid.to_string(),
                    cmd: cmd.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_render_status() {
        let table = render_status(&[
            entry("transcode-01", "active", &[("a1", "ffmpeg -i x"), ("b2", "ffprobe y")]),
            entry("w2", "idle", &[]),
        ]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("\x1b[1mServername  "));
        assert!(lines[1].starts_with("transcode-01  transcode-01"));
        assert!(lines[1].ends_with("PID a1: ffmpeg -i x"));
        assert!(lines[2].trim_start().starts_with("PID b2: ffprobe y"));
        assert_eq!(lines[1].find("PID"), lines[2].find("PID"));
        assert!(lines[3].ends_with("N/A"));
    }

    #[test]
    fn test_clear_flags_conflict() {
        assert!(Cli::try_parse_from(["ffmpegof", "clear", "--name", "w1", "--id", "2"]).is_err());
        let cli = Cli::try_parse_from(["ffmpegof", "add", "10.0.0.5", "-w", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Add { weight: 3, name: None, .. }
        ));
    }
}
