use reqwest::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientAuth,
    TransientRemote,
    NotYetAvailable,
    PermanentRemote,
    OrderingViolation,
}

/// Failures raised by calls against either remote system.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("authorization rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("HTTP {status}: {body}")]
    Permanent { status: u16, body: String },

    #[error("{0} is not available yet")]
    NotYetAvailable(String),

    #[error("{entity} requires parent {parent_id} which has not been imported")]
    OrderingViolation { entity: String, parent_id: i64 },
}

impl RemoteError {
    pub fn from_status(status: StatusCode, body: String) -> Self {
        if matches!(status, StatusCode::UNAUTHORIZED) {
            return Self::Auth {
                status: status.as_u16(),
            };
        }
        if status.is_server_error()
            || matches!(
                status,
                StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
            )
        {
            return Self::Transient(format!("HTTP {status}: {body}"));
        }
        Self::Permanent {
            status: status.as_u16(),
            body,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::TransientAuth,
            Self::Transient(_) => ErrorKind::TransientRemote,
            Self::Permanent { .. } => ErrorKind::PermanentRemote,
            Self::NotYetAvailable(_) => ErrorKind::NotYetAvailable,
            Self::OrderingViolation { .. } => ErrorKind::OrderingViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::PermanentRemote | ErrorKind::OrderingViolation
        )
    }
}

/// Classify an arbitrary error; anything that is not a `RemoteError` counts as transient.
pub fn error_kind(error: &anyhow::Error) -> ErrorKind {
    error
        .downcast_ref::<RemoteError>()
        .map(RemoteError::kind)
        .unwrap_or(ErrorKind::TransientRemote)
}

pub fn is_not_found(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<RemoteError>(),
        Some(RemoteError::Permanent { status: 404, .. })
    )
}
