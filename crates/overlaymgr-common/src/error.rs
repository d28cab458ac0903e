//! Error types for overlay manager operations.
//!
//! The variants follow the classes the reconciliation engine distinguishes:
//! objects that are already absent (or already present), transient kernel
//! and tool failures, fatal validation failures, and declared-resource store
//! outcomes.

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type alias for overlay manager operations.
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Errors that can occur while converging kernel networking state.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Kernel object (link, route, address, chain, rule) does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind, e.g. "link" or "route".
        kind: &'static str,
        /// Object identity.
        name: String,
    },

    /// Kernel object already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Object identity.
        name: String,
    },

    /// Egress link required for route convergence is absent.
    #[error("Link '{name}' not found")]
    LinkNotFound {
        /// The link name.
        name: String,
    },

    /// The local node address could not be determined.
    #[error("Local node address unavailable: {reason}")]
    AddressUnavailable {
        /// Why the lookup failed.
        reason: String,
    },

    /// The overlay network prefix was not supplied or is malformed.
    #[error("Overlay network prefix unavailable: {reason}")]
    OverlayPrefixUnavailable {
        /// Why the lookup failed.
        reason: String,
    },

    /// Configuration or declared-resource validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// No tunnel address could be chosen from the pool.
    #[error("Tunnel address pool exhausted (peer uses {peer})")]
    AddressPoolExhausted {
        /// The peer's tunnel private address.
        peer: Ipv4Addr,
    },

    /// Two nodes derive the same overlay address.
    #[error("Overlay address {address} of node '{local}' collides with node '{peer}'")]
    OverlayAddressCollision {
        /// The colliding address.
        address: Ipv4Addr,
        /// The local node name.
        local: String,
        /// The peer node name.
        peer: String,
    },

    /// A derived tunnel name is already recorded by another peering.
    #[error("Tunnel name '{name}' is owned by peering '{owner}'")]
    TunnelNameCollision {
        /// The derived interface name.
        name: String,
        /// The peering whose Status records the link.
        owner: String,
    },

    /// Declared resource does not exist in the store.
    #[error("Declared resource '{key}' not found")]
    ResourceNotFound {
        /// The resource identity.
        key: String,
    },

    /// Optimistic concurrency check failed on the declared resource.
    #[error("Conflict updating declared resource '{key}'")]
    Conflict {
        /// The resource identity.
        key: String,
    },

    /// Any other store failure.
    #[error("Store operation failed: {operation}: {message}")]
    Store {
        /// The operation that failed (e.g., "get", "update_status").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Output of a kernel or firewall tool could not be parsed.
    #[error("Failed to parse output of '{command}': {message}")]
    Parse {
        /// The command whose output was malformed.
        command: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl OverlayError {
    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the target object was already absent.
    ///
    /// Callers performing deletes treat this as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OverlayError::NotFound { .. } | OverlayError::ResourceNotFound { .. }
        )
    }

    /// Returns true if the target object was already present.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OverlayError::AlreadyExists { .. })
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OverlayError::ShellExec { .. }
                | OverlayError::ShellCommandFailed { .. }
                | OverlayError::LinkNotFound { .. }
                | OverlayError::Conflict { .. }
                | OverlayError::Store { .. }
        )
    }

    /// Returns true if blind retry without a configuration or resource
    /// change will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OverlayError::AddressUnavailable { .. }
                | OverlayError::OverlayPrefixUnavailable { .. }
                | OverlayError::InvalidConfig { .. }
                | OverlayError::AddressPoolExhausted { .. }
                | OverlayError::OverlayAddressCollision { .. }
                | OverlayError::TunnelNameCollision { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OverlayError::LinkNotFound {
            name: "gre-1a2b".to_string(),
        };
        assert_eq!(err.to_string(), "Link 'gre-1a2b' not found");
    }

    #[test]
    fn test_not_found_display() {
        let err = OverlayError::not_found("route", "10.244.1.0/24");
        assert_eq!(err.to_string(), "route '10.244.1.0/24' not found");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_shell_command_failed() {
        let err = OverlayError::ShellCommandFailed {
            command: "ip link set dev gre-1 up".to_string(),
            exit_code: 2,
            output: "Cannot find device".to_string(),
        };
        assert!(err.to_string().contains("ip link set dev"));
        assert!(err.to_string().contains("exit code 2"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classification() {
        assert!(OverlayError::already_exists("link", "vxlan.ovl").is_already_exists());
        assert!(OverlayError::Conflict {
            key: "default/peer-a".to_string()
        }
        .is_retryable());
        assert!(OverlayError::AddressUnavailable {
            reason: "NODE_IP not set".to_string()
        }
        .is_fatal());
        assert!(OverlayError::TunnelNameCollision {
            name: "gre-f08607cb".to_string(),
            owner: "default/peer-b".to_string(),
        }
        .is_fatal());
        assert!(!OverlayError::internal("bug").is_retryable());
        assert!(!OverlayError::internal("bug").is_fatal());
    }
}
