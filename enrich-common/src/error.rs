use thiserror::Error;

/// Enumeration of database-related errors in the StatusStore.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

/// Enumeration of parsing errors for values persisted by the StatusStore.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{0} is not a valid WorkStatus")]
    ParseWorkStatusError(String),
}
