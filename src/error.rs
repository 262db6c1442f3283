use thiserror::Error;

/// Faults the softphone can observe. None of them is fatal to the process;
/// the worst case is an unregistered device that keeps retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhoneError {
    /// Signaling connection dropped or could not be opened.
    #[error("transport fault: {0}")]
    Transport(String),

    /// Expired or invalid access token.
    #[error("credential fault: {0}")]
    Credential(String),

    /// Rejected at the command boundary (empty number, unknown agent, ...).
    #[error("{0}")]
    UserInput(String),

    #[error("device not ready")]
    NotReady,

    /// Command is not valid in the current call state.
    #[error("{0}")]
    InvalidState(String),

    /// Backend request failed before an answer was received.
    #[error("request failed: {0}")]
    Backend(String),

    /// Backend answered `success: false`; the reason is kept verbatim.
    #[error("{0}")]
    Rejected(String),

    /// Audio capture unavailable (usually permission denial).
    #[error("media unavailable: {0}")]
    Media(String),

    #[error("token request failed: {0}")]
    Token(String),
}

pub type Result<T> = std::result::Result<T, PhoneError>;

impl From<reqwest::Error> for PhoneError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => PhoneError::Backend(status.to_string()),
            None => PhoneError::Backend(e.to_string()),
        }
    }
}
