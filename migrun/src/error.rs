use crate::multistmt::Statement;
use crate::position::position_at_byte;
use std::fmt;

/// Error type for the migrun crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading the migration script failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A statement handler failed; carries the statement that was being handled.
    #[error("{statement}: {source}")]
    Statement {
        statement: String,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("can't acquire lock: this driver already holds it")]
    AlreadyLocked,
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("a transaction is already in progress")]
    TransactionInProgress,
    #[error("migration script exceeds the maximum size of {max} bytes")]
    ScriptTooLarge { max: usize },
    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because io::Error and postgres::Error don't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind() && a.to_string() == b.to_string(),
            (
                Self::Statement {
                    statement: a,
                    source: sa,
                },
                Self::Statement {
                    statement: b,
                    source: sb,
                },
            ) => a == b && sa == sb,
            (Self::Migration(a), Self::Migration(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (Self::AlreadyLocked, Self::AlreadyLocked) => true,
            (Self::NoTransaction, Self::NoTransaction) => true,
            (Self::TransactionInProgress, Self::TransactionInProgress) => true,
            (Self::ScriptTooLarge { max: a }, Self::ScriptTooLarge { max: b }) => a == b,
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}

/// A failure while executing migration SQL, annotated with where in the
/// script it happened.
///
/// Renders as
/// `<message> in line <L>: <query> (details: <source>)`, dropping the line
/// when it is unknown and falling back to the low-level message when no
/// summary was produced.
#[derive(Debug)]
pub struct MigrationError {
    /// Human readable summary, e.g. `migration failed: syntax error at or near "TABLEE" (column 37)`.
    pub message: Option<String>,
    /// 1-based line in [`query`](Self::query) the failure points at, when the engine reported a position.
    pub line: Option<usize>,
    /// The migration script (or statement) that was executed.
    pub query: String,
    /// The underlying engine error.
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl MigrationError {
    pub fn new(
        query: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            message: None,
            line: None,
            query: query.into(),
            source: source.into(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

/// What the engine said about a failed statement.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EngineReport<'a> {
    pub message: &'a str,
    pub detail: Option<&'a str>,
    /// 1-based character position in the statement.
    pub position: Option<usize>,
}

impl MigrationError {
    /// Build the error for a statement of `script` the engine rejected.
    ///
    /// The reported position is translated through the statement's source
    /// offsets, so line and column always refer to `script`, comments and
    /// substituted placeholders included.
    pub(crate) fn from_engine(
        script: &str,
        statement: &Statement,
        report: EngineReport<'_>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        let position = report
            .position
            .and_then(|pos| statement.source_offset(pos))
            .and_then(|offset| position_at_byte(script, offset));

        let mut message = format!("migration failed: {}", report.message);
        if let Some(position) = position {
            message = format!("{} (column {})", message, position.column);
        }
        if let Some(detail) = report.detail.filter(|d| !d.is_empty()) {
            message = format!("{}, {}", message, detail);
        }

        let err = MigrationError::new(script, source).with_message(message);
        match position {
            Some(position) => err.with_line(position.line),
            None => err,
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message)?,
            None => write!(f, "{}", self.source)?,
        }
        if let Some(line) = self.line {
            write!(f, " in line {}", line)?;
        }
        write!(f, ": {}", self.query)?;
        if self.message.is_some() {
            write!(f, " (details: {})", self.source)?;
        }
        Ok(())
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl PartialEq for MigrationError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
            && self.line == other.line
            && self.query == other.query
            && self.source.to_string() == other.source.to_string()
    }
}
