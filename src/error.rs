// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Errors returned by the orchestration core.
///
/// Runtime failures always carry the name of the node, network or cluster they occurred on.
/// Callers that need to branch on a particular condition (a load balancer backend being down, a
/// deadline expiring) should use the `is_*` helpers, which see through `Wrapped` layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: {source}")]
    Runtime {
        context: String,
        #[source]
        source: RuntimeError,
    },

    #[error("no free IP address left in network '{network}' ({prefix})")]
    NoFreeAddress { network: String, prefix: String },

    /// A node referenced in the new load balancer configuration is not reachable.
    #[error("loadbalancer could not resolve an upstream host: a referenced node seems to be down")]
    LbConfigHostNotFound,

    /// The load balancer never confirmed that it picked up the new configuration.
    #[error("failed to verify that the loadbalancer picked up its new configuration")]
    LbConfigFailedTest,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error(
        "error waiting for log line '{message}' from node '{node}' (running: {running}, status: '{status}'): {reason}"
    )]
    ReadinessFailed {
        node: String,
        message: String,
        running: bool,
        status: String,
        reason: String,
    },

    #[error("{stage} hook '{action}' failed on node '{node}': {source}")]
    Hook {
        stage: String,
        action: String,
        node: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cluster '{0}' not found")]
    ClusterNotFound(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Follow `Wrapped` and `Hook` layers down to the innermost error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Wrapped { source, .. } | Error::Hook { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_lb_host_not_found(&self) -> bool {
        matches!(self.root(), Error::LbConfigHostNotFound)
    }

    pub fn is_lb_failed_test(&self) -> bool {
        matches!(self.root(), Error::LbConfigFailedTest)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.root(), Error::DeadlineExceeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Runtime { source, .. } => source.is_not_found(),
            Error::ClusterNotFound(_) | Error::NodeNotFound(_) => true,
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

/// Attach the name of the resource an operation was acting on to its error.
pub trait ResultExt<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, RuntimeError> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|source| Error::Runtime {
            context: f(),
            source,
        })
    }
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|source| Error::Wrapped {
            context: f(),
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_sees_through_wrapping() {
        let err: Result<()> = Err(Error::LbConfigHostNotFound);
        let err = err
            .with_context(|| "updating loadbalancer".to_string())
            .with_context(|| "deleting node".to_string())
            .unwrap_err();

        assert!(err.is_lb_host_not_found());
        assert!(!err.is_lb_failed_test());
        assert!(!err.is_deadline_exceeded());
    }

    #[test]
    fn runtime_not_found() {
        let err: std::result::Result<(), RuntimeError> = Err(RuntimeError::NotFound {
            kind: "node",
            name: "k3d-x-server-0".to_string(),
        });
        let err = err.with_context(|| "getting node".to_string()).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("k3d-x-server-0"));
    }
}
