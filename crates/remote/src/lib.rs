//! Command lines for running ffmpeg/ffprobe either directly on this machine
//! or on a worker through ssh.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod ssh;
pub use ssh::{probe_command, quote_arg, ssh_command, strip_quiet, SshOptions};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{program} not found on PATH: {source}")]
    NotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("empty command line")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Ffmpeg,
    Ffprobe,
}

impl Program {
    /// Pick the program from the name this binary was invoked as.
    pub fn from_invocation(cmd: &str) -> Self {
        let name = Path::new(cmd)
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| cmd.into());
        if name.contains("ffprobe") {
            Program::Ffprobe
        } else {
            Program::Ffmpeg
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Program::Ffmpeg => "ffmpeg",
            Program::Ffprobe => "ffprobe",
        }
    }
}

/// Where the child's standard output ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoute {
    Stdout,
    Stderr,
}

/// ffprobe always writes to stdout. ffmpeg writes to stderr, except for
/// informational flags such as `-version` whose output callers parse.
pub fn output_route(program: Program, args: &[String], special_flags: &[String]) -> OutputRoute {
    match program {
        Program::Ffprobe => OutputRoute::Stdout,
        Program::Ffmpeg => {
            if args.iter().any(|arg| special_flags.contains(arg)) {
                OutputRoute::Stdout
            } else {
                OutputRoute::Stderr
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Binaries {
    pub fn path_for(&self, program: Program) -> &str {
        match program {
            Program::Ffmpeg => &self.ffmpeg,
            Program::Ffprobe => &self.ffprobe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub argv: Vec<String>,
    pub stdout: OutputRoute,
}

impl CommandLine {
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Arguments are passed through untouched; there is no extra shell layer.
pub fn local_command(
    binaries: &Binaries,
    program: Program,
    args: &[String],
    special_flags: &[String],
) -> CommandLine {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(binaries.path_for(program).to_string());
    argv.extend(args.iter().cloned());
    CommandLine {
        argv,
        stdout: output_route(program, args, special_flags),
    }
}

/// `ssh ... user@host <pre...> <binary> <quoted args...>`.
///
/// Pre-commands are operator-supplied shell text and go through verbatim;
/// every caller argument is escaped for the remote shell.
pub fn remote_command(
    ssh: &SshOptions,
    hostname: &str,
    pre: &[String],
    binaries: &Binaries,
    program: Program,
    args: &[String],
    special_flags: &[String],
) -> CommandLine {
    let mut argv = ssh_command(ssh, hostname);
    argv.extend(pre.iter().cloned());
    argv.push(quote_arg(binaries.path_for(program)).into_owned());
    argv.extend(args.iter().map(|arg| quote_arg(arg).into_owned()));
    CommandLine {
        argv,
        stdout: output_route(program, args, special_flags),
    }
}

/// Hostnames that are served by running the command on this machine.
pub fn is_loopback(hostname: &str) -> bool {
    if hostname.eq_ignore_ascii_case("localhost") {
        return true;
    }
    hostname
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Paths are used as given; bare names are looked up on PATH.
pub fn resolve_program(program: &str) -> Result<PathBuf, CommandError> {
    if program.is_empty() {
        return Err(CommandError::Empty);
    }
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(program));
    }
    let resolved = which::which(program).map_err(|source| CommandError::NotFound {
        program: program.to_string(),
        source,
    })?;
    tracing::debug!(program, path = %resolved.display(), "resolved program on PATH");
    Ok(resolved)
}
