/// Shared error type used across all Conclave crates.
///
/// The variants mirror the propagation policy: `Validation` and
/// `ScopeViolation` are soft failures surfaced back to the LLM,
/// `Transport` and `Signature` are infrastructure outcomes, and
/// `Cancelled` is a terminal state rather than a fault.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("scope violation: {0}")]
    ScopeViolation(String),

    #[error("execution: {0}")]
    Execution(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("signature: {0}")]
    Signature(String),

    #[error("cancelled")]
    Cancelled,

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error should be shown to the LLM as tool error text
    /// instead of terminating the loop.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::ScopeViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
