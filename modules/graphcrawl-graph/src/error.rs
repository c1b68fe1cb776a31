use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    /// Two writers raced on the same vertex or edge (transient error or deadlock).
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// The bolt connection dropped or could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An edge endpoint has not been upserted yet.
    #[error("Missing vertex: {0}")]
    MissingVertex(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Neo4j error: {0}")]
    Neo4j(String),
}

impl GraphError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, GraphError::Conflict(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, GraphError::Connection(_))
    }
}

/// Conflict and connection errors are told apart by the server's status code
/// (`Neo.TransientError.*`) or the driver's error kind as rendered by Debug.
impl From<neo4rs::Error> for GraphError {
    fn from(err: neo4rs::Error) -> Self {
        let detail = format!("{err:?}");
        if is_conflict_detail(&detail) {
            GraphError::Conflict(err.to_string())
        } else if is_connection_detail(&detail) {
            GraphError::Connection(err.to_string())
        } else {
            GraphError::Neo4j(err.to_string())
        }
    }
}

impl From<neo4rs::DeError> for GraphError {
    fn from(err: neo4rs::DeError) -> Self {
        GraphError::Decode(err.to_string())
    }
}

fn is_conflict_detail(detail: &str) -> bool {
    detail.contains("TransientError") || detail.contains("DeadlockDetected")
}

fn is_connection_detail(detail: &str) -> bool {
    detail.contains("IOError")
        || detail.contains("ConnectionError")
        || detail.contains("ConnectionRefused")
        || detail.contains("BrokenPipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlocks_are_conflicts() {
        assert!(is_conflict_detail(
            "Neo4j(Neo4jError { code: \"Neo.TransientError.Transaction.DeadlockDetected\" })"
        ));
        assert!(!is_conflict_detail("Neo4j(Neo4jError { code: \"Neo.ClientError.Schema\" })"));
    }

    #[test]
    fn io_errors_are_connection_errors() {
        assert!(is_connection_detail("IOError { detail: Kind(BrokenPipe) }"));
        assert!(!is_connection_detail("UnexpectedMessage(\"FAILURE\")"));
    }
}
