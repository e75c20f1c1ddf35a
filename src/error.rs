use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the distributor
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Ledger gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Audit sink error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors raised while reading the input CSV. Always fatal, always raised
/// before any chain interaction.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("FormatError: {0}")]
    Format(String),

    #[error("Malformed CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Ledger gateway errors - simulation, admission and execution failures
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Simulation failed: {0}")]
    Simulation(String),

    #[error("Transaction rejected at submission ({status}): {detail}")]
    Rejected { status: String, detail: String },

    #[error("Transaction {hash} failed on-chain: {detail}")]
    ExecutionFailed { hash: String, detail: String },

    #[error("TransactionExpired: {hash} not confirmed after {waited_secs}s")]
    TransactionExpired { hash: String, waited_secs: u64 },

    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("XDR codec error: {0}")]
    Codec(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Unexpected contract return value: {0}")]
    UnexpectedReturn(String),
}

/// Proportional allocation contract violations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Proportional division by zero requested total")]
    ZeroDenominator,

    #[error("Requested amounts sum to {actual}, expected {expected}")]
    TotalMismatch { expected: u128, actual: u128 },

    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),
}

/// Audit trail persistence errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit CSV write: {0}")]
    Csv(#[from] csv::Error),
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        GatewayError::Transport(format!("HTTP request error: {:?}", error))
    }
}

impl From<stellar_xdr::curr::Error> for GatewayError {
    fn from(error: stellar_xdr::curr::Error) -> Self {
        GatewayError::Codec(format!("{:?}", error))
    }
}

impl From<base64::DecodeError> for GatewayError {
    fn from(error: base64::DecodeError) -> Self {
        GatewayError::Codec(format!("base64: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
