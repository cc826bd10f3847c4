use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("datastore error: {0:#}")]
    Store(anyhow::Error),
    #[error("host {hostname} is unreachable: {reason}")]
    Probe { hostname: String, reason: String },
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("no host named {0}")]
    HostNotFound(String),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Store(err)
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
