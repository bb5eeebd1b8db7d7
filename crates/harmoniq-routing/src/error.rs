use thiserror::Error;

/// Failures reported by driver callbacks, on either side of the thread boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("operation not supported by the driver")]
    Unsupported,
    #[error("driver failure: {0}")]
    Failed(String),
}

/// Result codes of the routing core.
///
/// Validation and state errors are ordinary control flow (a caller probing
/// whether a move is possible gets `Refused`), so they are returned without
/// being logged. Only [`RoutingError::Driver`] represents a resource failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("{0} not found")]
    NoEntity(&'static str),
    #[error("name already registered: {0}")]
    Exists(String),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("bad state: {0}")]
    BadState(&'static str),
    #[error("too many streams on device")]
    TooLarge,
    #[error("device busy: {0}")]
    Busy(&'static str),
    #[error("refused: {0}")]
    Refused(&'static str),
    #[error("canceled by hook")]
    Canceled,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("realtime thread disconnected")]
    Disconnected,
}

impl RoutingError {
    pub fn driver(message: impl Into<String>) -> Self {
        RoutingError::Driver(DriverError::Failed(message.into()))
    }

    /// True for failures that should be logged and published; everything else
    /// is an expected refusal.
    pub fn is_resource_failure(&self) -> bool {
        matches!(self, RoutingError::Driver(_) | RoutingError::Disconnected)
    }
}

pub type RoutingResult<T> = Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_convert_and_classify() {
        let err: RoutingError = DriverError::Failed("resume".into()).into();
        assert!(err.is_resource_failure());
        assert_eq!(err, RoutingError::driver("resume"));
        assert!(!RoutingError::Refused("pinned").is_resource_failure());
    }
}
