//! Picks the worker a job runs on.
//!
//! Per-host state is gathered concurrently, then hosts are scanned one by
//! one in registration order: bad hosts are skipped, remote hosts are
//! probed, the first idle host wins outright and otherwise the host with the
//! lowest `running / weight` is kept. When nothing qualifies the job runs
//! locally.

use crate::error::{DispatchError, Result};
use crate::ledger::Ledger;
use crate::probe::ReachabilityProbe;
use crate::InvocationId;
use std::sync::Arc;
use store::{HostRow, StateKind, FALLBACK_HOST_ID};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const FALLBACK_SERVERNAME: &str = "localhost (fallback)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentState {
    Idle,
    Active,
    Bad,
}

impl CurrentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrentState::Idle => "idle",
            CurrentState::Active => "active",
            CurrentState::Bad => "bad",
        }
    }
}

impl From<StateKind> for CurrentState {
    fn from(kind: StateKind) -> Self {
        match kind {
            StateKind::Active => CurrentState::Active,
            StateKind::Bad => CurrentState::Bad,
        }
    }
}

/// Snapshot of one host taken at selection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMapping {
    pub id: i64,
    pub servername: String,
    pub hostname: String,
    pub weight: u32,
    pub current_state: CurrentState,
    /// Invocation that wrote the latest state row.
    pub marking_pid: Option<String>,
    pub running_process_ids: Vec<String>,
}

impl HostMapping {
    pub fn running(&self) -> u64 {
        self.running_process_ids.len() as u64
    }

    pub fn weighted_load(&self) -> u64 {
        self.running() / u64::from(self.weight.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHost {
    pub id: i64,
    pub servername: String,
    pub hostname: String,
    pub weight: u32,
}

impl TargetHost {
    pub fn fallback() -> Self {
        Self {
            id: FALLBACK_HOST_ID,
            servername: FALLBACK_SERVERNAME.to_string(),
            hostname: "localhost".to_string(),
            weight: 0,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.id == FALLBACK_HOST_ID
    }
}

impl From<&HostMapping> for TargetHost {
    fn from(mapping: &HostMapping) -> Self {
        Self {
            id: mapping.id,
            servername: mapping.servername.clone(),
            hostname: mapping.hostname.clone(),
            weight: mapping.weight,
        }
    }
}

#[derive(Debug)]
pub struct Selection {
    pub host: TargetHost,
    /// Last non-fatal failure seen while selecting. Informational only.
    pub last_error: Option<DispatchError>,
}

impl Selection {
    fn new(host: TargetHost, last_error: Option<DispatchError>) -> Self {
        Self { host, last_error }
    }
}

pub async fn gather_mapping(ledger: &Ledger, host: HostRow) -> Result<HostMapping> {
    let latest = ledger.current_state(host.id).await?;
    let processes = ledger.processes_for_host(host.id).await?;
    let (current_state, marking_pid) = match latest {
        Some(row) => (CurrentState::from(row.state), Some(row.process_id)),
        None => (CurrentState::Idle, None),
    };
    Ok(HostMapping {
        id: host.id,
        servername: host.servername,
        hostname: host.hostname,
        weight: host.weight,
        current_state,
        marking_pid,
        running_process_ids: processes.into_iter().map(|p| p.process_id).collect(),
    })
}

/// Mappings for every host, in the order given. Hosts whose lookup failed
/// are left out; the last failure is returned alongside.
pub async fn gather_mappings(
    ledger: &Ledger,
    hosts: Vec<HostRow>,
    max_parallel: usize,
) -> (Vec<HostMapping>, Option<DispatchError>) {
    let limit = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut tasks = JoinSet::new();
    let count = hosts.len();

    for (index, host) in hosts.into_iter().enumerate() {
        let ledger = ledger.clone();
        let limit = Arc::clone(&limit);
        tasks.spawn(async move {
            let servername = host.servername.clone();
            // the semaphore is never closed
            let _permit = limit.acquire_owned().await.ok();
            (index, servername, gather_mapping(&ledger, host).await)
        });
    }

    let mut slots: Vec<Option<HostMapping>> = vec![None; count];
    let mut last_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, _, Ok(mapping))) => slots[index] = Some(mapping),
            Ok((_, servername, Err(err))) => {
                tracing::warn!(servername, error = %err, "failed to read host state, skipping host");
                last_error = Some(err);
            }
            Err(err) => {
                tracing::warn!(error = %err, "host state task failed");
                last_error = Some(DispatchError::Join(err));
            }
        }
    }
    (slots.into_iter().flatten().collect(), last_error)
}

pub async fn select_target(
    ledger: &Ledger,
    probe: &dyn ReachabilityProbe,
    invocation: &InvocationId,
    max_parallel: usize,
) -> Selection {
    let hosts = match ledger.list_hosts().await {
        Ok(hosts) => hosts,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load hosts, running locally");
            return Selection::new(TargetHost::fallback(), Some(err));
        }
    };
    if hosts.is_empty() {
        tracing::debug!("no hosts configured, running locally");
        return Selection::new(TargetHost::fallback(), None);
    }

    let (mappings, mut last_error) = gather_mappings(ledger, hosts, max_parallel).await;

    let mut best: Option<TargetHost> = None;
    let mut lowest = u64::MAX;
    for mapping in &mappings {
        if mapping.current_state == CurrentState::Bad {
            tracing::debug!(
                servername = %mapping.servername,
                marked_by = mapping.marking_pid.as_deref().unwrap_or("-"),
                "skipping host marked bad"
            );
            continue;
        }

        if !remote::is_loopback(&mapping.hostname) {
            if let Err(err) = probe.probe(&mapping.hostname).await {
                tracing::warn!(
                    servername = %mapping.servername,
                    error = %err,
                    "host failed reachability probe, marking bad"
                );
                last_error = Some(err);
                if let Err(err) = ledger
                    .record_state(mapping.id, invocation, StateKind::Bad)
                    .await
                {
                    tracing::error!(servername = %mapping.servername, error = %err, "failed to mark host bad");
                    last_error = Some(err);
                }
                continue;
            }
        }

        if mapping.current_state == CurrentState::Idle {
            tracing::debug!(servername = %mapping.servername, "selected idle host");
            return Selection::new(TargetHost::from(mapping), last_error);
        }

        let load = mapping.weighted_load();
        tracing::trace!(servername = %mapping.servername, load, lowest, "weighted load");
        if load < lowest {
            lowest = load;
            best = Some(TargetHost::from(mapping));
        }
    }

    match best {
        Some(host) => {
            tracing::debug!(servername = %host.servername, load = lowest, "selected least loaded host");
            Selection::new(host, last_error)
        }
        None => {
            tracing::info!("no usable host, running locally");
            Selection::new(TargetHost::fallback(), last_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(running: usize, weight: u32) -> HostMapping {
        HostMapping {
            id: 1,
            servername: "w".to_string(),
            hostname: "w".to_string(),
            weight,
            current_state: CurrentState::Active,
            marking_pid: None,
            running_process_ids: (0..running).map(|i| i.to_string()).collect(),
        }
    }

    #[test]
    fn test_weighted_load_floors() {
        assert_eq!(mapping(3, 2).weighted_load(), 1);
        assert_eq!(mapping(2, 1).weighted_load(), 2);
        assert_eq!(mapping(1, 4).weighted_load(), 0);
        assert_eq!(mapping(5, 0).weighted_load(), 5);
    }

    #[test]
    fn test_fallback_target() {
        let host = TargetHost::fallback();
        assert!(host.is_fallback());
        assert_eq!(host.hostname, "localhost");
        assert_eq!(host.servername, "localhost (fallback)");
        assert_eq!(host.weight, 0);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CurrentState::from(StateKind::Bad).as_str(), "bad");
        assert_eq!(CurrentState::Idle.as_str(), "idle");
    }
}
