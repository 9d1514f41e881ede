//! Crate-wide error type.

use std::io;

use thiserror::Error;

/// Result type alias for slotwise operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cluster client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error that is not a redirect.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Authentication failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// An operation did not complete within its deadline.
    #[error("timed out after {millis} ms")]
    Timeout {
        /// The deadline that elapsed, in milliseconds.
        millis: u64,
    },

    /// No seed answered the initial topology query.
    ///
    /// Fatal: returned from client construction.
    #[error("cannot retrieve initial cluster partitions from seeds {seeds:?}")]
    BootstrapFailure {
        /// The seed addresses that were tried.
        seeds: Vec<String>,
    },

    /// No seed answered a topology refresh round.
    ///
    /// The partition table is left unchanged.
    #[error("cluster topology refresh failed, no seed answered among {seeds:?}")]
    RefreshFailure {
        /// The seed addresses that were tried.
        seeds: Vec<String>,
    },

    /// A multi-key command whose keys hash to different slots.
    #[error("CROSSSLOT keys in request don't hash to the same slot")]
    CrossSlot,

    /// Could not reach a specific node.
    #[error("cannot connect to {address}: {source}")]
    Connection {
        /// The node address.
        address: String,
        /// Why the connection could not be used.
        #[source]
        source: Box<Error>,
    },

    /// The command was redirected more often than its retry ceiling allows.
    #[error("too many redirections ({executions} executions), last target {address}")]
    RedirectExhausted {
        /// How many times the command was executed.
        executions: u32,
        /// The node the last redirect pointed at.
        address: String,
    },

    /// The cluster reported it cannot serve the request.
    #[error("CLUSTERDOWN {message}")]
    ClusterDown {
        /// Remainder of the server message.
        message: String,
    },

    /// The client was shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl Error {
    pub(crate) fn connection(address: impl Into<String>, source: Error) -> Self {
        Error::Connection {
            address: address.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn closed() -> Self {
        Error::Io {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
        }
    }
}
