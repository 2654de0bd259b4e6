use crate::{LifecycleState, ResourceKind};
use thiserror::Error;

/// Failure taxonomy of the provisioning core.
///
/// An unreachable agent is deliberately absent: it is reported through
/// `MachineDescriptor::agent_reachable`, never raised.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("no free {kind} name after {attempts} attempts (allowed server limit reached)")]
    NameSpaceExhausted { kind: ResourceKind, attempts: u32 },

    #[error("{operation} timed out ({resource})")]
    Timeout {
        operation: &'static str,
        resource: String,
    },

    #[error("cloud reported {resource_id} in {state} state")]
    UnexpectedTerminalState {
        resource_id: String,
        state: LifecycleState,
    },

    #[error("{call} failed: {source:#}")]
    RemoteCallFailure {
        call: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("unexpected {call} response: {detail}")]
    UnexpectedResponse { call: &'static str, detail: String },

    #[error("found existing servers matching group {group}: {descriptions}")]
    AlreadyProvisioned { group: String, descriptions: String },

    #[error(
        "{failure_count} of {total_count} machines failed to start; first error: {first_cause}"
    )]
    PartialFleetFailure {
        first_cause: Box<ProvisioningError>,
        failure_count: usize,
        total_count: usize,
        /// Termination errors hit while rolling back the other machines.
        cleanup_errors: Vec<String>,
    },

    #[error("deadline already passed")]
    InvalidDuration,

    #[error("bootstrap packaging failed: {reason}")]
    Bootstrap { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("driver is shut down")]
    DriverClosed,
}

impl ProvisioningError {
    pub fn remote(call: &'static str, source: anyhow::Error) -> Self {
        ProvisioningError::RemoteCallFailure { call, source }
    }

    pub fn timeout(operation: &'static str, resource: impl Into<String>) -> Self {
        ProvisioningError::Timeout {
            operation,
            resource: resource.into(),
        }
    }

    pub fn bootstrap(reason: impl std::fmt::Display) -> Self {
        ProvisioningError::Bootstrap {
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable code, used in action logs and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ProvisioningError::NameSpaceExhausted { .. } => "NAME_SPACE_EXHAUSTED",
            ProvisioningError::Timeout { .. } => "TIMEOUT",
            ProvisioningError::UnexpectedTerminalState { .. } => "UNEXPECTED_TERMINAL_STATE",
            ProvisioningError::RemoteCallFailure { .. } => "REMOTE_CALL_FAILURE",
            ProvisioningError::UnexpectedResponse { .. } => "UNEXPECTED_RESPONSE",
            ProvisioningError::AlreadyProvisioned { .. } => "ALREADY_PROVISIONED",
            ProvisioningError::PartialFleetFailure { .. } => "PARTIAL_FLEET_FAILURE",
            ProvisioningError::InvalidDuration => "INVALID_DURATION",
            ProvisioningError::Bootstrap { .. } => "BOOTSTRAP_FAILED",
            ProvisioningError::Configuration { .. } => "CONFIGURATION",
            ProvisioningError::DriverClosed => "DRIVER_CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_message_carries_first_cause() {
        let err = ProvisioningError::PartialFleetFailure {
            first_cause: Box::new(ProvisioningError::UnexpectedTerminalState {
                resource_id: "i-9".into(),
                state: LifecycleState::Terminated,
            }),
            failure_count: 1,
            total_count: 3,
            cleanup_errors: vec![],
        };
        assert_eq!(
            err.to_string(),
            "1 of 3 machines failed to start; first error: cloud reported i-9 in terminated state"
        );
        assert_eq!(err.code(), "PARTIAL_FLEET_FAILURE");
    }

    #[test]
    fn remote_failure_keeps_source_chain() {
        let err = ProvisioningError::remote(
            "create_tags",
            anyhow::anyhow!("throttled").context("POST /tags"),
        );
        assert_eq!(err.to_string(), "create_tags failed: POST /tags: throttled");
    }
}
