pub mod config;
pub mod context;
pub mod dialect;
pub mod query;
pub mod session;
pub mod types;

pub use config::{ConnectionSettings, PoolSettings};
pub use context::{ConnectParams, SqlContext};
pub use query::ExecMode;
pub use session::{CallerId, ConnectionKind};
pub use types::{Row, Value};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqlSessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pool configuration error: {0}")]
    PoolConfiguration(String),

    #[error("Timed out after {0} seconds waiting for a pooled connection")]
    PoolTimeout(u64),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Statement error: {0}")]
    Statement(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Operation '{operation}' is not supported on {kind} connections")]
    UnsupportedOperation {
        operation: String,
        kind: ConnectionKind,
    },

    #[error("No active connection")]
    NoActiveConnection,
}

pub type Result<T> = std::result::Result<T, SqlSessionError>;

impl SqlSessionError {
    /// SQLSTATE-style code for this error, for hosts that translate errors into their own signals
    pub fn error_code(&self) -> &'static str {
        match self {
            SqlSessionError::Configuration(_) => "F0000", // config_file_error
            SqlSessionError::PoolConfiguration(_) => "22023", // invalid_parameter_value
            SqlSessionError::PoolTimeout(_) => "08004", // sqlserver_rejected_establishment_of_sqlconnection
            SqlSessionError::ConnectionFailure(_) => "08006", // connection_failure
            SqlSessionError::Statement(_) => "42601", // syntax_error
            SqlSessionError::Transaction(_) => "25000", // invalid_transaction_state
            SqlSessionError::UnsupportedOperation { .. } => "0A000", // feature_not_supported
            SqlSessionError::NoActiveConnection => "08003", // connection_does_not_exist
        }
    }

    pub(crate) fn statement(err: rusqlite::Error) -> Self {
        SqlSessionError::Statement(err.to_string())
    }

    pub(crate) fn transaction(err: rusqlite::Error) -> Self {
        SqlSessionError::Transaction(err.to_string())
    }
}
