//! Runs the job on the selected host and records it while it runs.

use crate::config::Config;
use crate::error::{DispatchError, Result};
use crate::ledger::Ledger;
use crate::selector::TargetHost;
use crate::InvocationId;
use remote::{is_loopback, local_command, remote_command, CommandLine, OutputRoute, Program};
use std::os::fd::AsFd;
use std::process::{ExitStatus, Stdio};
use store::StateKind;
use tokio::process::Command;

#[derive(Debug)]
pub struct ExecutionReport {
    pub status: Result<ExitStatus>,
    pub process_insert: Result<()>,
    pub state_insert: Result<()>,
}

/// The command line that runs `args` on `target`.
pub fn build_command(
    config: &Config,
    target: &TargetHost,
    program: Program,
    args: &[String],
) -> CommandLine {
    if is_loopback(&target.hostname) {
        local_command(
            &config.local_binaries(),
            program,
            args,
            &config.commands.special_flags,
        )
    } else {
        remote_command(
            &config.ssh_options(),
            &target.hostname,
            &config.commands.pre,
            &config.remote_binaries(),
            program,
            args,
            &config.commands.special_flags,
        )
    }
}

/// Text stored in the process table, e.g. `ffmpeg -i in.mkv out.mp4`.
pub fn bookkeeping_cmd(program: Program, args: &[String]) -> String {
    std::iter::once(program.name())
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn stdout_for(route: OutputRoute) -> Stdio {
    match route {
        OutputRoute::Stdout => Stdio::inherit(),
        OutputRoute::Stderr => match std::io::stderr().as_fd().try_clone_to_owned() {
            Ok(fd) => Stdio::from(fd),
            Err(err) => {
                tracing::warn!(error = %err, "cannot duplicate stderr, child output goes to stdout");
                Stdio::inherit()
            }
        },
    }
}

async fn run(command: &CommandLine) -> Result<ExitStatus> {
    let (program, args) = command.argv.split_first().ok_or_else(|| DispatchError::Launch {
        program: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
    })?;
    let launch_error = |source| DispatchError::Launch {
        program: program.clone(),
        source,
    };

    let resolved = remote::resolve_program(program).map_err(|err| {
        launch_error(std::io::Error::new(std::io::ErrorKind::NotFound, err))
    })?;

    let mut child = Command::new(resolved)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(stdout_for(command.stdout))
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(launch_error)?;
    tracing::debug!(pid = child.id(), "child started");
    child.wait().await.map_err(launch_error)
}

/// Launch the job and record it as running on `target`. The two inserts
/// run alongside the child; a failed insert does not stop the job.
pub async fn execute(
    config: &Config,
    ledger: &Ledger,
    invocation: &InvocationId,
    target: &TargetHost,
    program: Program,
    args: &[String],
) -> ExecutionReport {
    let command = build_command(config, target, program, args);
    let cmd = bookkeeping_cmd(program, args);
    tracing::info!(
        servername = %target.servername,
        invocation = %invocation,
        command = %command.display(),
        "running {}",
        program.name()
    );

    let (status, process_insert, state_insert) = tokio::join!(
        run(&command),
        async {
            ledger
                .record_process(target.id, invocation, &cmd)
                .await
                .map(|_| ())
        },
        async {
            ledger
                .record_state(target.id, invocation, StateKind::Active)
                .await
                .map(|_| ())
        },
    );

    if let Err(err) = &process_insert {
        tracing::warn!(error = %err, "failed to record process");
    }
    if let Err(err) = &state_insert {
        tracing::warn!(error = %err, "failed to record host state");
    }
    match &status {
        Ok(status) => tracing::info!(%status, "{} finished", program.name()),
        Err(err) => tracing::error!(error = %err, "{} could not be run", program.name()),
    }

    ExecutionReport {
        status,
        process_insert,
        state_insert,
    }
}
