//! Read and reset bookkeeping for the `status` and `clear` commands.

use crate::error::{DispatchError, Result};
use crate::ledger::Ledger;
use crate::selector::{CurrentState, FALLBACK_SERVERNAME};
use store::{ProcessRow, FALLBACK_HOST_ID};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCommand {
    pub process_id: String,
    pub cmd: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub servername: String,
    pub hostname: String,
    pub id: i64,
    pub weight: u32,
    /// `idle`, `active`, `bad`, or `fallback` for local jobs.
    pub state: &'static str,
    pub commands: Vec<ActiveCommand>,
}

fn active_commands(rows: Vec<ProcessRow>) -> Vec<ActiveCommand> {
    rows.into_iter()
        .map(|row| ActiveCommand {
            process_id: row.process_id,
            cmd: row.cmd,
        })
        .collect()
}

/// One entry per host in selection order, preceded by a fallback entry
/// when jobs are running locally.
pub async fn status(ledger: &Ledger) -> Result<Vec<StatusEntry>> {
    let mut entries = Vec::new();

    let local = ledger.processes_for_host(FALLBACK_HOST_ID).await?;
    if !local.is_empty() {
        entries.push(StatusEntry {
            servername: FALLBACK_SERVERNAME.to_string(),
            hostname: "localhost".to_string(),
            id: FALLBACK_HOST_ID,
            weight: 0,
            state: "fallback",
            commands: active_commands(local),
        });
    }

    for host in ledger.list_hosts().await? {
        let state = match ledger.current_state(host.id).await? {
            Some(row) => CurrentState::from(row.state),
            None => CurrentState::Idle,
        };
        let commands = active_commands(ledger.processes_for_host(host.id).await?);
        entries.push(StatusEntry {
            servername: host.servername,
            hostname: host.hostname,
            id: host.id,
            weight: host.weight,
            state: state.as_str(),
            commands,
        });
    }
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTarget<'a> {
    All,
    Name(&'a str),
    /// Id 0 addresses jobs that ran locally.
    Id(i64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub processes: usize,
    pub states: usize,
}

pub async fn clear(ledger: &Ledger, target: ClearTarget<'_>) -> Result<ClearReport> {
    let host_id = match target {
        ClearTarget::All => {
            let (processes, states) =
                tokio::join!(ledger.delete_all_processes(), ledger.delete_all_states());
            let report = ClearReport {
                processes: processes?,
                states: states?,
            };
            tracing::info!(processes = report.processes, states = report.states, "cleared all hosts");
            return Ok(report);
        }
        ClearTarget::Name(name) => ledger
            .find_host_by_name(name)
            .await?
            .ok_or_else(|| DispatchError::HostNotFound(name.to_string()))?
            .id,
        ClearTarget::Id(FALLBACK_HOST_ID) => FALLBACK_HOST_ID,
        ClearTarget::Id(id) => ledger
            .find_host_by_id(id)
            .await?
            .ok_or_else(|| DispatchError::HostNotFound(format!("id {id}")))?
            .id,
    };

    let (processes, states) = tokio::join!(
        ledger.delete_processes_for_host(host_id),
        ledger.delete_states_for_host(host_id),
    );
    let report = ClearReport {
        processes: processes?,
        states: states?,
    };
    tracing::info!(host_id, processes = report.processes, states = report.states, "cleared host");
    Ok(report)
}
