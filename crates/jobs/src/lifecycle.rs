//! One dispatch from start to exit: select, execute, race against
//! termination signals, clean up.

use crate::config::Config;
use crate::error::{DispatchError, Result};
use crate::executor;
use crate::ledger::Ledger;
use crate::probe::ReachabilityProbe;
use crate::selector;
use crate::InvocationId;
use remote::Program;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
}

impl TerminationSignal {
    pub fn signo(&self) -> i32 {
        match self {
            TerminationSignal::Hangup => 1,
            TerminationSignal::Interrupt => 2,
            TerminationSignal::Quit => 3,
            TerminationSignal::Terminate => 15,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TerminationSignal::Hangup => "SIGHUP",
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Quit => "SIGQUIT",
            TerminationSignal::Terminate => "SIGTERM",
        }
    }
}

/// SIGINT, SIGTERM, SIGQUIT and SIGHUP, registered up front.
pub struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    hangup: Signal,
}

impl TerminationSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    pub async fn recv(&mut self) -> TerminationSignal {
        tokio::select! {
            _ = self.interrupt.recv() => TerminationSignal::Interrupt,
            _ = self.terminate.recv() => TerminationSignal::Terminate,
            _ = self.quit.recv() => TerminationSignal::Quit,
            _ = self.hangup.recv() => TerminationSignal::Hangup,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Finished(ExitStatus),
    Failed(DispatchError),
    ForcedQuit(TerminationSignal),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Finished(status) => status
                .code()
                .or_else(|| status.signal().map(|signo| 128 + signo))
                .unwrap_or(1),
            Outcome::Failed(_) => 1,
            Outcome::ForcedQuit(signal) => 128 + signal.signo(),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<Config>,
    ledger: Ledger,
    probe: Arc<dyn ReachabilityProbe>,
    invocation: InvocationId,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        ledger: Ledger,
        probe: Arc<dyn ReachabilityProbe>,
        invocation: InvocationId,
    ) -> Self {
        Self {
            config,
            ledger,
            probe,
            invocation,
        }
    }

    pub fn invocation(&self) -> &InvocationId {
        &self.invocation
    }

    /// Select a host and run the job there, without signal handling or
    /// cleanup.
    pub async fn dispatch(&self, program: Program, args: &[String]) -> Result<ExitStatus> {
        let selection = selector::select_target(
            &self.ledger,
            self.probe.as_ref(),
            &self.invocation,
            self.config.selector.max_parallel,
        )
        .await;
        if let Some(err) = &selection.last_error {
            tracing::debug!(error = %err, "last error during host selection");
        }
        tracing::info!(
            servername = %selection.host.servername,
            hostname = %selection.host.hostname,
            "selected host"
        );

        let report = executor::execute(
            &self.config,
            &self.ledger,
            &self.invocation,
            &selection.host,
            program,
            args,
        )
        .await;
        report.status
    }

    /// Dispatch with SIGINT/SIGTERM/SIGQUIT/SIGHUP ending the wait early.
    pub async fn run(&self, program: Program, args: Vec<String>) -> Outcome {
        let mut signals = match TerminationSignals::register() {
            Ok(signals) => Some(signals),
            Err(err) => {
                tracing::warn!(error = %err, "failed to install signal handlers");
                None
            }
        };
        let shutdown = async move {
            match signals.as_mut() {
                Some(signals) => signals.recv().await,
                None => std::future::pending().await,
            }
        };
        self.run_until(program, args, shutdown).await
    }

    /// Dispatch until the job ends or `shutdown` resolves, then clean up.
    ///
    /// A forced quit abandons selection and bookkeeping but leaves an
    /// already started child process running.
    pub async fn run_until<F>(&self, program: Program, args: Vec<String>, shutdown: F) -> Outcome
    where
        F: Future<Output = TerminationSignal>,
    {
        let mut job = {
            let this = self.clone();
            tokio::spawn(async move { this.dispatch(program, &args).await })
        };

        let signal = tokio::select! {
            joined = &mut job => {
                let outcome = match joined {
                    Ok(Ok(status)) => Outcome::Finished(status),
                    Ok(Err(err)) => Outcome::Failed(err),
                    Err(err) => Outcome::Failed(DispatchError::Join(err)),
                };
                self.cleanup().await;
                return outcome;
            }
            signal = shutdown => signal,
        };

        tracing::warn!(signal = signal.name(), "terminated, cleaning up");
        job.abort();
        // resolves once the task has been dropped
        if let Ok(Err(err)) = job.await {
            tracing::debug!(error = %err, "job ended before the abort");
        }
        self.ledger.settle().await;
        self.cleanup().await;
        Outcome::ForcedQuit(signal)
    }

    /// Remove every process and state row written by this invocation.
    /// Failures are logged; running it again is harmless.
    pub async fn cleanup(&self) {
        let (processes, states) = tokio::join!(
            self.ledger.delete_processes_for_invocation(&self.invocation),
            self.ledger.delete_states_for_invocation(&self.invocation),
        );
        match processes {
            Ok(n) => tracing::debug!(rows = n, "removed process rows"),
            Err(err) => tracing::error!(error = %err, "failed to remove process rows"),
        }
        match states {
            Ok(n) => tracing::debug!(rows = n, "removed state rows"),
            Err(err) => tracing::error!(error = %err, "failed to remove state rows"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Finished(ExitStatus::from_raw(3 << 8)).exit_code(), 3);
        assert_eq!(Outcome::Finished(ExitStatus::from_raw(0)).exit_code(), 0);
        // killed by SIGKILL
        assert_eq!(Outcome::Finished(ExitStatus::from_raw(9)).exit_code(), 137);
        assert_eq!(
            Outcome::Failed(DispatchError::HostNotFound("x".into())).exit_code(),
            1
        );
        assert_eq!(Outcome::ForcedQuit(TerminationSignal::Interrupt).exit_code(), 130);
        assert_eq!(Outcome::ForcedQuit(TerminationSignal::Terminate).exit_code(), 143);
        assert_eq!(Outcome::ForcedQuit(TerminationSignal::Quit).exit_code(), 131);
        assert_eq!(Outcome::ForcedQuit(TerminationSignal::Hangup).exit_code(), 129);
    }
}
