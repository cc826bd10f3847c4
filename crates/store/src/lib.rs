//! SQLite-backed bookkeeping for configured hosts, in-flight processes and
//! the append-only host state log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host id reserved for local execution. Never stored in `hosts`.
pub const FALLBACK_HOST_ID: i64 = 0;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRow {
    pub id: i64,
    pub servername: String,
    pub hostname: String,
    pub weight: u32,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHost<'a> {
    pub servername: &'a str,
    pub hostname: &'a str,
    pub weight: u32,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub id: i64,
    pub host_id: i64,
    pub process_id: String,
    pub cmd: String,
}

#[derive(Debug, Clone)]
pub struct NewProcess<'a> {
    pub host_id: i64,
    pub process_id: &'a str,
    pub cmd: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Active,
    Bad,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Active => "active",
            StateKind::Bad => "bad",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(StateKind::Active),
            "bad" => Some(StateKind::Bad),
            _ => None,
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for StateKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for StateKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        StateKind::parse(raw).ok_or_else(|| FromSqlError::Other(format!("unknown state {raw:?}").into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRow {
    pub id: i64,
    pub host_id: i64,
    pub process_id: String,
    pub state: StateKind,
}

#[derive(Debug, Clone)]
pub struct NewState<'a> {
    pub host_id: i64,
    pub process_id: &'a str,
    pub state: StateKind,
}

/// Column filter shared by the process and state tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFilter<'a> {
    HostId(i64),
    ProcessId(&'a str),
}

impl RowFilter<'_> {
    fn column(&self) -> &'static str {
        match self {
            RowFilter::HostId(_) => "host_id",
            RowFilter::ProcessId(_) => "process_id",
        }
    }

    fn value(&self) -> Value {
        match self {
            RowFilter::HostId(id) => Value::Integer(*id),
            RowFilter::ProcessId(pid) => Value::Text((*pid).to_string()),
        }
    }
}

pub struct Datastore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Datastore {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create database directory {}", dir.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        // Several dispatcher invocations share this file at once.
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn version(&self) -> Result<String> {
        let conn = self.conn.lock();
        let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        Ok(format!("SQLite {version}"))
    }

    // ---------------------------------------------------------------------
    // hosts
    // ---------------------------------------------------------------------

    /// Insert a host, or update hostname/weight/created of the host with the
    /// same servername.
    pub fn upsert_host(&self, host: &NewHost<'_>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO hosts(servername, hostname, weight, created) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(servername) DO UPDATE SET
                 hostname = excluded.hostname,
                 weight = excluded.weight,
                 created = excluded.created",
            params![
                host.servername,
                host.hostname,
                host.weight,
                host.created.timestamp_millis()
            ],
        )
        .with_context(|| format!("upsert host {}", host.servername))?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_host(&self, servername: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM hosts WHERE servername = ?1", params![servername])
            .with_context(|| format!("delete host {servername}"))?;
        Ok(removed)
    }

    pub fn delete_hosts(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM hosts", []).context("delete hosts")?)
    }

    /// All hosts, oldest first.
    pub fn list_hosts(&self) -> Result<Vec<HostRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, servername, hostname, weight, created FROM hosts ORDER BY created ASC, id ASC",
        )?;
        let rows = stmt.query_map([], host_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("select hosts")
    }

    pub fn count_hosts(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(id) FROM hosts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn find_host_by_name(&self, servername: &str) -> Result<Option<HostRow>> {
        let conn = self.conn.lock();
        let host = conn
            .query_row(
                "SELECT id, servername, hostname, weight, created FROM hosts WHERE servername = ?1",
                params![servername],
                host_from_row,
            )
            .optional()?;
        Ok(host)
    }

    pub fn find_host_by_id(&self, id: i64) -> Result<Option<HostRow>> {
        let conn = self.conn.lock();
        let host = conn
            .query_row(
                "SELECT id, servername, hostname, weight, created FROM hosts WHERE id = ?1",
                params![id],
                host_from_row,
            )
            .optional()?;
        Ok(host)
    }

    // ---------------------------------------------------------------------
    // processes
    // ---------------------------------------------------------------------

    pub fn insert_process(&self, process: &NewProcess<'_>) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO processes(host_id, process_id, cmd) VALUES(?1, ?2, ?3)",
            params![process.host_id, process.process_id, process.cmd],
        )
        .context("insert process")?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_processes(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM processes", []).context("delete processes")?)
    }

    pub fn delete_processes_where(&self, filter: RowFilter<'_>) -> Result<usize> {
        let conn = self.conn.lock();
        let sql = format!("DELETE FROM processes WHERE {} = ?1", filter.column());
        let removed = conn
            .execute(&sql, params![filter.value()])
            .with_context(|| format!("delete processes by {}", filter.column()))?;
        Ok(removed)
    }

    pub fn count_processes(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(id) FROM processes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_processes_for_host(&self, host_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(id) FROM processes WHERE host_id = ?1",
            params![host_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn list_processes(&self) -> Result<Vec<ProcessRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, host_id, process_id, cmd FROM processes ORDER BY id ASC")?;
        let rows = stmt.query_map([], process_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("select processes")
    }

    /// Processes bound to a host, newest first.
    pub fn list_processes_for_host(&self, host_id: i64) -> Result<Vec<ProcessRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, host_id, process_id, cmd FROM processes WHERE host_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![host_id], process_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("select processes for host {host_id}"))
    }

    // ---------------------------------------------------------------------
    // states
    // ---------------------------------------------------------------------

    pub fn insert_state(&self, state: &NewState<'_>) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO states(host_id, process_id, state) VALUES(?1, ?2, ?3)",
            params![state.host_id, state.process_id, state.state],
        )
        .context("insert state")?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_states(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM states", []).context("delete states")?)
    }

    pub fn delete_states_where(&self, filter: RowFilter<'_>) -> Result<usize> {
        let conn = self.conn.lock();
        let sql = format!("DELETE FROM states WHERE {} = ?1", filter.column());
        let removed = conn
            .execute(&sql, params![filter.value()])
            .with_context(|| format!("delete states by {}", filter.column()))?;
        Ok(removed)
    }

    pub fn count_states(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(id) FROM states", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_states_for_host(&self, host_id: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(id) FROM states WHERE host_id = ?1",
            params![host_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn list_states(&self) -> Result<Vec<StateRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, host_id, process_id, state FROM states ORDER BY id ASC")?;
        let rows = stmt.query_map([], state_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("select states")
    }

    /// State log of a host, most recent first.
    pub fn list_states_for_host(&self, host_id: i64) -> Result<Vec<StateRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, host_id, process_id, state FROM states WHERE host_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![host_id], state_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("select states for host {host_id}"))
    }

    /// The most recently inserted state row still present for a host.
    pub fn latest_state_for_host(&self, host_id: i64) -> Result<Option<StateRow>> {
        let conn = self.conn.lock();
        let state = conn
            .query_row(
                "SELECT id, host_id, process_id, state FROM states WHERE host_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![host_id],
                state_from_row,
            )
            .optional()
            .with_context(|| format!("select latest state for host {host_id}"))?;
        Ok(state)
    }
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<HostRow> {
    let created_ms: i64 = row.get(4)?;
    let created = DateTime::<Utc>::from_timestamp_millis(created_ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, created_ms))?;
    Ok(HostRow {
        id: row.get(0)?,
        servername: row.get(1)?,
        hostname: row.get(2)?,
        weight: row.get(3)?,
        created,
    })
}

fn process_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessRow> {
    Ok(ProcessRow {
        id: row.get(0)?,
        host_id: row.get(1)?,
        process_id: row.get(2)?,
        cmd: row.get(3)?,
    })
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<StateRow> {
    Ok(StateRow {
        id: row.get(0)?,
        host_id: row.get(1)?,
        process_id: row.get(2)?,
        state: row.get(3)?,
    })
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))
        .context("apply migration V0001__init")?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__init"],
    )?;
    Ok(())
}
