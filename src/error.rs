// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// The error type for cluster routing, transport, and scan operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument was rejected before any network activity.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// No nodes are known to the cluster at call time.
    #[error("cluster has no nodes")]
    ClusterEmpty,
    /// A retry-eligible transport failure.
    #[error("transient transport error: {0}")]
    Transient(String),
    /// A request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// The server returned a non-zero result code.
    #[error("server error: result code {0}")]
    ServerError(u8),
    /// A wire frame could not be parsed.
    #[error("malformed frame: {0}")]
    ParseError(String),
    /// A scan was torn down after another worker latched a failure.
    #[error("scan aborted")]
    ScanAborted,
    /// The user callback returned false. Never surfaced to callers; the
    /// aggregate scan status suppresses this to ok.
    #[error("scan stopped by user callback")]
    ClientAbort,
    /// `destroy` may only be invoked through the original cluster handle.
    #[error("destroy called on a cluster handle clone")]
    DestroyCalledByClone,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that indicate the operation may succeed if retried
    /// against the same or another node.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Timeout)
    }
}
