//! Store-level errors shared by the Postgres and in-memory transaction stores.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// Row addressed by id does not exist
    NotFound { entity: String, id: String },
    /// A unique index rejected the write
    UniqueViolation { constraint: String },
    /// Pool exhausted, connection refused, or similar
    Connection { message: String },
    /// Query failed for any other reason
    Query { message: String },
    /// A stored value could not be mapped back into the domain type
    Decode { column: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn decode(column: &str, message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Decode {
            column: column.to_string(),
            message: message.into(),
        })
    }

    /// Connection failures are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Connection { .. })
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => DatabaseErrorKind::Connection {
                message: err.to_string(),
            },
            sqlx::Error::ColumnDecode { index, source } => DatabaseErrorKind::Decode {
                column: index.clone(),
                message: source.to_string(),
            },
            _ => DatabaseErrorKind::Query {
                message: err.to_string(),
            },
        };
        Self::new(kind)
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                write!(f, "unique constraint violated: {}", constraint)
            }
            DatabaseErrorKind::Connection { message } => write!(f, "connection error: {}", message),
            DatabaseErrorKind::Query { message } => write!(f, "query error: {}", message),
            DatabaseErrorKind::Decode { column, message } => {
                write!(f, "failed to decode column {}: {}", column, message)
            }
        }
    }
}

impl std::error::Error for DatabaseError {}
