//! Error kinds for the slot migration path.

use thiserror::Error;

pub type MigrateResult<T> = std::result::Result<T, MigrateError>;

/// Failure classification for a migration run. Every kind carries a
/// human-readable message; the state machine logs it and transitions to
/// the failed stage without retrying.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The stop flag was observed at a poll point.
    #[error("key migration stopped due to a task cancellation")]
    Cancelled,

    /// Connect, send, receive, or receive-timeout failure on the
    /// destination socket.
    #[error("network error: {context}: {source}")]
    NetworkIo {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The destination sent bytes that do not form a valid reply.
    #[error("protocol error: {0}")]
    ProtocolParse(String),

    /// The destination answered a command with an error reply.
    #[error("destination replied with an error: {0}")]
    Destination(String),

    /// A store read (iterator, metadata decode, WAL fetch) failed.
    #[error("db read error: {0}")]
    DbRead(String),

    /// The WAL tail observed a sequence gap.
    #[error("wal discontinuity: expected sequence {expected}, got {got}")]
    Discontinuity { expected: u64, got: u64 },

    /// A branch that the state machine treats as unreachable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MigrateError {
    pub fn network(context: &'static str, source: std::io::Error) -> Self {
        Self::NetworkIo { context, source }
    }

    pub fn db_read(err: impl std::fmt::Display) -> Self {
        Self::DbRead(err.to_string())
    }
}
