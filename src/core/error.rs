use crate::transaction::TransactionId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("You are not using the WithDBTransactions middleware")]
    NotActive,

    #[error("You must pass a callable as the hook argument")]
    InvalidCallable,

    #[error("Unknown hook phase '{0}'")]
    UnknownHookPhase(String),

    #[error("A transaction is already open for this attempt")]
    TransactionAlreadyOpen,

    #[error("No open transaction")]
    NoOpenTransaction,

    #[error("Transaction '{0}' not found")]
    TransactionNotFound(TransactionId),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Middleware '{0}' is not registered")]
    UnknownMiddleware(String),

    #[error("Invalid middleware reference: {0}")]
    InvalidMiddlewareSpec(String),
}

impl TxError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TxError::NotActive => "not_active",
            TxError::InvalidCallable => "invalid_callable",
            TxError::UnknownHookPhase(_) => "unknown_hook_phase",
            TxError::TransactionAlreadyOpen => "transaction_already_open",
            TxError::NoOpenTransaction => "no_open_transaction",
            TxError::TransactionNotFound(_) => "transaction_not_found",
            TxError::Backend(_) => "backend_error",
            TxError::Config(_) => "config_error",
            TxError::UnknownMiddleware(_) => "unknown_middleware",
            TxError::InvalidMiddlewareSpec(_) => "invalid_middleware_spec",
        }
    }
}

pub type Result<T> = std::result::Result<T, TxError>;
