use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::repo::StorageError;

/// Errors raised by the simulation core.
#[derive(Debug, Error)]
pub enum SimError {
    /// A simulation is already running; start/restore is a one-shot precondition.
    #[error("a simulation is already running")]
    AlreadyRunning,

    /// The simulation reached its terminal state and cannot be started again.
    #[error("simulation has already been stopped")]
    AlreadyStopped,

    #[error("no running simulation")]
    NoRunningSimulation,

    #[error("simulation state has not been created yet")]
    NoState,

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// No wind sample exists on either side of the queried time.
    #[error("no wind recorded around {time}")]
    NotRecorded { time: DateTime<Utc> },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SimError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        SimError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Configuration conditions are fatal and must never be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SimError::AlreadyRunning
                | SimError::AlreadyStopped
                | SimError::NoRunningSimulation
                | SimError::NoState
        )
    }
}

pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(SimError::AlreadyRunning.is_configuration());
        assert!(SimError::NoState.is_configuration());
        assert!(!SimError::not_found("house", 7).is_configuration());
        assert!(!SimError::Storage(StorageError::Closed).is_configuration());
    }

    #[test]
    fn test_not_found_message() {
        let err = SimError::not_found("house", 42);
        assert_eq!(err.to_string(), "house not found: 42");
    }
}
