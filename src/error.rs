use mongodb::bson;
use thiserror::Error as ThisError;

/// A type alias for convenience so we can fix the error to our own `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error enumerates the fatal and non-fatal conditions the replication pipeline can hit.
///
/// Variants map onto the taxonomy of `SPEC_FULL.md` §7; `Orchestrator` treats everything here
/// as fatal to the pipeline that raised it except where a caller explicitly downgrades it (e.g.
/// a per-document write failure, which is logged and counted rather than propagated as this
/// type).
#[derive(Debug, ThisError)]
pub enum Error {
    /// Missing required option or contradictory flags.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A database connectivity error raised by the MongoDB driver.
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    /// A connect/auth attempt failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// The endpoint that was being connected to.
        endpoint: String,
        /// The underlying driver error.
        #[source]
        source: mongodb::error::Error,
    },

    /// A required topology precondition did not hold (e.g. balancer running).
    #[error("topology precondition violated: {0}")]
    TopologyPrecondition(String),

    /// The source oplog no longer contains the position we need to resume from.
    #[error("oplog has rolled off: needed position older than {needed}")]
    OplogRolledOff {
        /// A human-readable description of the position we needed.
        needed: String,
    },

    /// An error when converting a BSON document to an `Operation` and it has a missing field or
    /// unexpected type.
    #[error("missing or malformed field: {0}")]
    MissingField(#[from] bson::document::ValueAccessError),

    /// An error when converting a BSON document to an `Operation` and it has an unsupported
    /// operation type.
    #[error("unknown operation type found: {0}")]
    UnknownOperation(String),

    /// An error when converting an applyOps command with invalid documents.
    #[error("invalid operation")]
    InvalidOperation,

    /// The pipeline was asked to shut down.
    #[error("shutdown requested")]
    Shutdown,
}

impl From<mongodb::bson::ser::Error> for Error {
    fn from(original: mongodb::bson::ser::Error) -> Error {
        Error::Configuration(original.to_string())
    }
}
