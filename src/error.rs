use std::convert::Infallible;

/// Machine-checkable category of a rejected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    State,
    NotFound,
    Computation,
    Forbidden,
    Config,
    Storage,
}

impl ErrorKind {
    /// Stable code, safe to match on across releases.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Conflict => "CONFLICT_ERROR",
            ErrorKind::State => "STATE_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Computation => "COMPUTATION_ERROR",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Storage => "STORAGE_ERROR",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("cannot {action} {entity} in '{status}' status")]
    State {
        entity: &'static str,
        action: &'static str,
        status: String,
    },
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Computation(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode or decode record: {0}")]
    Encoding(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::State { .. } => ErrorKind::State,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Computation(_) => ErrorKind::Computation,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Config(_) => ErrorKind::Config,
            Error::Storage(_) | Error::Encoding(_) | Error::Other(_) => ErrorKind::Storage,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn state(entity: &'static str, action: &'static str, status: impl ToString) -> Self {
        Error::State {
            entity,
            action,
            status: status.to_string(),
        }
    }
}

impl From<minicbor::encode::Error<Infallible>> for Error {
    fn from(err: minicbor::encode::Error<Infallible>) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl From<minicbor::decode::Error> for Error {
    fn from(err: minicbor::decode::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_names_the_failed_precondition() {
        let err = Error::state("AFE", "approve", "Draft");
        assert_eq!(err.to_string(), "cannot approve AFE in 'Draft' status");
        assert_eq!(err.code(), "STATE_ERROR");
    }

    #[test]
    fn storage_family_shares_a_code() {
        let err = Error::Encoding("truncated".into());
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
