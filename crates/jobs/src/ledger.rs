//! Async access to the datastore. Every call runs on the blocking pool.

use crate::error::Result;
use crate::InvocationId;
use chrono::Utc;
use std::sync::Arc;
use store::{
    Datastore, HostRow, NewHost, NewProcess, NewState, ProcessRow, RowFilter, StateKind,
    StateRow,
};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct Ledger {
    store: Arc<Datastore>,
    /// Read-held by every call until its blocking work has finished.
    in_flight: Arc<RwLock<()>>,
}

impl Ledger {
    pub fn new(store: Arc<Datastore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(RwLock::new(())),
        }
    }

    /// Wait for the blocking work of every call started on any clone. That
    /// work runs to completion even when the calling task is aborted.
    pub async fn settle(&self) {
        drop(self.in_flight.write().await);
    }

    pub fn store(&self) -> &Arc<Datastore> {
        &self.store
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Datastore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let guard = Arc::clone(&self.in_flight).read_owned().await;
        let out = tokio::task::spawn_blocking(move || {
            let out = f(&store);
            drop(guard);
            out
        })
        .await?;
        Ok(out?)
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostRow>> {
        self.call(|store| store.list_hosts()).await
    }

    pub async fn find_host_by_name(&self, servername: &str) -> Result<Option<HostRow>> {
        let servername = servername.to_string();
        self.call(move |store| store.find_host_by_name(&servername))
            .await
    }

    pub async fn find_host_by_id(&self, id: i64) -> Result<Option<HostRow>> {
        self.call(move |store| store.find_host_by_id(id)).await
    }

    pub async fn upsert_host(&self, servername: &str, hostname: &str, weight: u32) -> Result<()> {
        let servername = servername.to_string();
        let hostname = hostname.to_string();
        self.call(move |store| {
            store.upsert_host(&NewHost {
                servername: &servername,
                hostname: &hostname,
                weight,
                created: Utc::now(),
            })
        })
        .await
    }

    pub async fn delete_host(&self, servername: &str) -> Result<usize> {
        let servername = servername.to_string();
        self.call(move |store| store.delete_host(&servername)).await
    }

    /// Latest surviving state of a host, `None` when the log is empty.
    pub async fn current_state(&self, host_id: i64) -> Result<Option<StateRow>> {
        self.call(move |store| store.latest_state_for_host(host_id))
            .await
    }

    pub async fn processes_for_host(&self, host_id: i64) -> Result<Vec<ProcessRow>> {
        self.call(move |store| store.list_processes_for_host(host_id))
            .await
    }

    pub async fn list_processes(&self) -> Result<Vec<ProcessRow>> {
        self.call(|store| store.list_processes()).await
    }

    pub async fn record_process(
        &self,
        host_id: i64,
        invocation: &InvocationId,
        cmd: &str,
    ) -> Result<i64> {
        let process_id = invocation.to_string();
        let cmd = cmd.to_string();
        self.call(move |store| {
            store.insert_process(&NewProcess {
                host_id,
                process_id: &process_id,
                cmd: &cmd,
            })
        })
        .await
    }

    pub async fn record_state(
        &self,
        host_id: i64,
        invocation: &InvocationId,
        state: StateKind,
    ) -> Result<i64> {
        let process_id = invocation.to_string();
        self.call(move |store| {
            store.insert_state(&NewState {
                host_id,
                process_id: &process_id,
                state,
            })
        })
        .await
    }

    pub async fn delete_processes_for_host(&self, host_id: i64) -> Result<usize> {
        self.call(move |store| store.delete_processes_where(RowFilter::HostId(host_id)))
            .await
    }

    pub async fn delete_states_for_host(&self, host_id: i64) -> Result<usize> {
        self.call(move |store| store.delete_states_where(RowFilter::HostId(host_id)))
            .await
    }

    pub async fn delete_processes_for_invocation(&self, invocation: &InvocationId) -> Result<usize> {
        let process_id = invocation.to_string();
        self.call(move |store| store.delete_processes_where(RowFilter::ProcessId(&process_id)))
            .await
    }

    pub async fn delete_states_for_invocation(&self, invocation: &InvocationId) -> Result<usize> {
        let process_id = invocation.to_string();
        self.call(move |store| store.delete_states_where(RowFilter::ProcessId(&process_id)))
            .await
    }

    pub async fn delete_all_processes(&self) -> Result<usize> {
        self.call(|store| store.delete_processes()).await
    }

    pub async fn delete_all_states(&self) -> Result<usize> {
        self.call(|store| store.delete_states()).await
    }
}
