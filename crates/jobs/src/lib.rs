//! Dispatch engine: pick a worker for an ffmpeg/ffprobe invocation, run it
//! there, and keep the shared bookkeeping straight.

use std::fmt;
use uuid::Uuid;

pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lifecycle;
pub mod probe;
pub mod registry;
pub mod selector;

pub use config::{Config, ConfigError};
pub use error::DispatchError;
pub use ledger::Ledger;
pub use lifecycle::{Dispatcher, Outcome, TerminationSignal};
pub use probe::{ReachabilityProbe, SshProbe};
pub use registry::HostRegistry;
pub use selector::{select_target, CurrentState, HostMapping, Selection, TargetHost};

/// Tags every row one dispatch writes so they can be removed together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for InvocationId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_ids_are_unique() {
        let a = InvocationId::new();
        let b = InvocationId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert_eq!(InvocationId::from("abc").to_string(), "abc");
    }
}
