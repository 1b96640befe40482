use thiserror::Error;

/// Coordinator error kinds.
///
/// `Transient` failures are retried locally with backoff; `ProtocolReject`
/// and `Hardware` are counted and never abort anything; `Config` and `Fatal`
/// surface at startup.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("pool rejected share: {0}")]
    ProtocolReject(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("thermal limit reached on device {0}")]
    Thermal(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Transient(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Transient(format!("bad json: {}", e))
    }
}

impl From<hex::FromHexError> for CoreError {
    fn from(e: hex::FromHexError) -> Self {
        CoreError::Transient(format!("bad hex: {}", e))
    }
}

