use strata_integrations::{ErrorStatus, split_error_payload};

/// Failure of a CLI invocation reduced to what the user sees: a message and
/// the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub status: ErrorStatus,
    pub message: String,
}

impl Failure {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// Classifies a `"<error-name>: <message>"` payload returned by the agent.
/// Payloads without a known error name are server errors.
pub fn classify_payload(payload: &str) -> Failure {
    match split_error_payload(payload) {
        (Some(name), message) => Failure {
            status: ErrorStatus::from_error_name(name),
            message: message.to_string(),
        },
        (None, message) => Failure {
            status: ErrorStatus::ServerError,
            message: message.to_string(),
        },
    }
}

fn agent_payload(err: &zbus::Error) -> Option<&str> {
    match err {
        zbus::Error::MethodError(_, Some(detail), _) => Some(detail.as_str()),
        zbus::Error::FDO(fdo) => match fdo.as_ref() {
            zbus::fdo::Error::Failed(detail) => Some(detail.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// Finds the agent's error payload anywhere in the chain; anything else
/// (bus unavailable, agent not running, malformed reply) is a server error.
pub fn classify(err: &anyhow::Error) -> Failure {
    let payload = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<zbus::Error>())
        .find_map(agent_payload);
    match payload {
        Some(payload) => classify_payload(payload),
        None => Failure {
            status: ErrorStatus::ServerError,
            message: format!("{err:#}"),
        },
    }
}
