//! Operator-facing host management.

use crate::error::{DispatchError, Result};
use crate::ledger::Ledger;
use store::HostRow;

pub struct HostRegistry {
    ledger: Ledger,
}

impl HostRegistry {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Add a host or replace the one registered under the same name. The
    /// name defaults to the hostname.
    pub async fn add(&self, hostname: &str, name: Option<&str>, weight: u32) -> Result<HostRow> {
        let hostname = hostname.trim();
        if hostname.is_empty() || hostname.contains(char::is_whitespace) {
            return Err(DispatchError::InvalidHost(format!(
                "hostname {hostname:?} is not usable"
            )));
        }
        if weight == 0 {
            return Err(DispatchError::InvalidHost(
                "weight must be at least 1".to_string(),
            ));
        }
        let servername = match name.map(str::trim) {
            Some("") => {
                return Err(DispatchError::InvalidHost(
                    "name must not be empty".to_string(),
                ))
            }
            Some(name) => name,
            None => hostname,
        };

        self.ledger.upsert_host(servername, hostname, weight).await?;
        tracing::info!(servername, hostname, weight, "host added");
        self.ledger
            .find_host_by_name(servername)
            .await?
            .ok_or_else(|| DispatchError::HostNotFound(servername.to_string()))
    }

    pub async fn remove(&self, servername: &str) -> Result<()> {
        let removed = self.ledger.delete_host(servername).await?;
        if removed == 0 {
            return Err(DispatchError::HostNotFound(servername.to_string()));
        }
        tracing::info!(servername, "host removed");
        Ok(())
    }

    /// Hosts in selection order.
    pub async fn list(&self) -> Result<Vec<HostRow>> {
        self.ledger.list_hosts().await
    }
}
