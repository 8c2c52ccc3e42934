//! Common error types for the Rustainer network stack.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`RustainerError`].
pub type RustainerResult<T> = Result<T, RustainerError>;

/// Common errors across the Rustainer crates.
#[derive(Error, Diagnostic, Debug)]
pub enum RustainerError {
    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(rustainer::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// No free address remains in the subnet.
    #[error("Address pool exhausted for subnet {subnet}")]
    #[diagnostic(
        code(rustainer::ipam::exhausted),
        help("Detach unused containers or configure a larger subnet")
    )]
    PoolExhausted {
        /// The subnet that ran out of addresses.
        subnet: String,
    },

    /// A resource that must be unique already exists.
    #[error("{kind} already exists: {name}")]
    #[diagnostic(
        code(rustainer::already_exists),
        help("Detach the container or run a reconcile pass first")
    )]
    AlreadyExists {
        /// Resource kind (namespace, link, container).
        kind: String,
        /// Resource name.
        name: String,
    },

    /// A network interface is not present on the host.
    #[error("Interface not found: {name}")]
    #[diagnostic(code(rustainer::interface::not_found))]
    InterfaceNotFound {
        /// The interface name.
        name: String,
    },

    /// A non-interface host resource is not present.
    #[error("{kind} not found: {name}")]
    #[diagnostic(code(rustainer::not_found))]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
    },

    /// An operation exceeded its time bound.
    #[error("Timed out after {after:?}: {operation}")]
    #[diagnostic(code(rustainer::timeout))]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(rustainer::permission_denied),
        help("Network namespace, link and iptables operations need CAP_NET_ADMIN (try sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// A rule owned by this system exists with unexpected parameters.
    #[error("Conflicting {chain} rule: expected `{expected}`, found `{found}`")]
    #[diagnostic(
        code(rustainer::nat::conflict),
        help("Run `rustainer-net reconcile` to remove stale rules")
    )]
    RuleConflict {
        /// The chain holding the rule.
        chain: String,
        /// The descriptor that was expected.
        expected: String,
        /// The rule that was found instead.
        found: String,
    },

    /// One or more teardown steps failed.
    #[error("Partial teardown of {container_id}: {}", failures.join("; "))]
    #[diagnostic(code(rustainer::teardown::partial))]
    PartialTeardown {
        /// The container being torn down.
        container_id: String,
        /// Description of each failed step.
        failures: Vec<String>,
    },

    /// The bridge cannot be removed while containers are attached.
    #[error("Bridge {bridge} still has {attached} attached container(s)")]
    #[diagnostic(code(rustainer::bridge::in_use))]
    BridgeInUse {
        /// The bridge name.
        bridge: String,
        /// Number of live records.
        attached: usize,
    },

    /// Another operation on the same container is still in progress.
    #[error("Container {container_id} is busy ({state})")]
    #[diagnostic(
        code(rustainer::container::busy),
        help("Wait for the pending attach or detach to finish")
    )]
    Busy {
        /// The container ID.
        container_id: String,
        /// State of the in-flight operation.
        state: String,
    },

    /// A host command exited unsuccessfully.
    #[error("Command `{command}` failed: {stderr}")]
    #[diagnostic(code(rustainer::command))]
    CommandFailed {
        /// The command line.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled: {operation}")]
    #[diagnostic(code(rustainer::cancelled))]
    Cancelled {
        /// The cancelled operation.
        operation: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(rustainer::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(rustainer::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(rustainer::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(rustainer::internal),
        help("This is a bug, please report it at https://github.com/rustainer/rustainer/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl RustainerError {
    /// Whether the error means the resource is already gone.
    ///
    /// Teardown paths treat this as success.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InterfaceNotFound { .. } | Self::NotFound { .. }
        )
    }
}

impl From<serde_json::Error> for RustainerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RustainerError::PoolExhausted {
            subnet: "172.18.0.0/30".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Address pool exhausted for subnet 172.18.0.0/30"
        );
    }

    #[test]
    fn partial_teardown_lists_failures() {
        let err = RustainerError::PartialTeardown {
            container_id: "c1".to_string(),
            failures: vec!["delete veth".to_string(), "delete netns".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Partial teardown of c1: delete veth; delete netns"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RustainerError = io_err.into();
        assert!(matches!(err, RustainerError::Io(_)));
    }

    #[test]
    fn not_found_classification() {
        let missing = RustainerError::InterfaceNotFound {
            name: "rustainer0".to_string(),
        };
        let denied = RustainerError::PermissionDenied {
            operation: "ip link add".to_string(),
        };
        assert!(missing.is_not_found());
        assert!(!denied.is_not_found());
    }
}
