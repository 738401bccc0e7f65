//! Sync error taxonomy
//!
//! Every failure that aborts a run is one of these. They travel inside
//! `anyhow::Error` so call sites keep adding context, and `main` recovers
//! the variant with `downcast_ref` to pick an exit code.

use std::time::Duration;

use crate::models::ExecutionState;

#[derive(Debug, Clone)]
pub enum SyncError {
    /// Missing or placeholder credentials, bad identifiers, unreadable config.
    Configuration(String),
    /// Network-level failure talking to a remote service.
    Transport {
        service: &'static str,
        message: String,
    },
    /// The analytics API rejected a request or returned an unexpected body.
    Api {
        status: Option<u16>,
        message: String,
    },
    /// SQL execution or bulk load failure.
    Warehouse(String),
    /// The remote execution ended in `Failed` or `Cancelled`.
    ExecutionFailed {
        execution_id: String,
        state: ExecutionState,
        message: Option<String>,
    },
    /// The execution did not complete within the configured wait.
    PollTimeout {
        execution_id: String,
        waited: Duration,
    },
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transport(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            service,
            message: err.to_string(),
        }
    }

    pub fn api(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn warehouse(message: impl Into<String>) -> Self {
        Self::Warehouse(message.into())
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            _ => 1,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(m) => write!(f, "configuration error: {}", m),
            Self::Transport { service, message } => {
                write!(f, "transport error ({}): {}", service, message)
            }
            Self::Api {
                status: Some(s),
                message,
            } => write!(f, "api error (HTTP {}): {}", s, message),
            Self::Api {
                status: None,
                message,
            } => write!(f, "api error: {}", message),
            Self::Warehouse(m) => write!(f, "warehouse error: {}", m),
            Self::ExecutionFailed {
                execution_id,
                state,
                message,
            } => {
                write!(f, "execution {} ended in state {}", execution_id, state)?;
                if let Some(m) = message {
                    write!(f, ": {}", m)?;
                }
                Ok(())
            }
            Self::PollTimeout {
                execution_id,
                waited,
            } => write!(
                f,
                "execution {} did not complete within {}s",
                execution_id,
                waited.as_secs()
            ),
        }
    }
}

impl std::error::Error for SyncError {}

/// Find the `SyncError` inside an `anyhow` chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&SyncError> {
    err.chain().find_map(|e| e.downcast_ref::<SyncError>())
}
