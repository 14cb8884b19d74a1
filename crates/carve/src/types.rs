//! Error taxonomy shared by every stage of the pipeline.

/// Errors that can occur while fetching or extracting.
///
/// `Clone` because a failed reference is memoized and handed to every later
/// caller of that name.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CarveError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Reference '{name}' failed: {reason}")]
    Resolution { name: String, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl CarveError {
    /// True for deadline expiry on a fetch or a pool slot.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CarveError::Timeout(_))
    }

    pub(crate) fn resolution(name: &str, reason: impl Into<String>) -> Self {
        CarveError::Resolution {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for CarveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CarveError::Timeout(e.to_string())
        } else {
            CarveError::Transport(e.to_string())
        }
    }
}

/// Convenience result type.
pub type CarveResult<T> = Result<T, CarveError>;
