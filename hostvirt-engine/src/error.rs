//! Error types for the orchestration engine.

use thiserror::Error;

/// Errors that can occur during hypervisor, storage and host operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Missing or contradictory required fields. Raised before any RPC.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Domain, pool, volume, snapshot or device lookup miss.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate object or device target.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Non-zero exit from an external tool, with its combined output.
    #[error("External tool failed: `{command}` (exit {exit_code:?}): {output}")]
    ExternalToolFailure {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// The secure-shell channel to a remote host could not be used.
    #[error("Remote host unreachable: {0}")]
    RemoteUnreachable(String),

    /// The hypervisor or guest does not support the requested change.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Ownership or permission change was refused.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Object is in an invalid state for the requested operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// An external process exceeded its deadline and was killed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// The hypervisor rejected a request.
    #[error("Hypervisor request failed: {0}")]
    Rpc(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Local filesystem or process error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// An error annotated with the operation and object it happened on.
    #[error("{operation} {target}: {source}")]
    Context {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<HypervisorError>,
    },
}

impl HypervisorError {
    /// The innermost error, with all operation context peeled off.
    pub fn root(&self) -> &HypervisorError {
        match self {
            HypervisorError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), HypervisorError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), HypervisorError::AlreadyExists(_))
    }

    /// The program itself was missing (shell exit status 127).
    pub fn is_command_not_found(&self) -> bool {
        matches!(
            self.root(),
            HypervisorError::ExternalToolFailure { exit_code: Some(127), .. }
        )
    }

    /// Wrap the error with the operation and target identifier.
    pub fn context(self, operation: &'static str, target: impl Into<String>) -> Self {
        HypervisorError::Context {
            operation,
            target: target.into(),
            source: Box::new(self),
        }
    }
}

impl From<quick_xml::DeError> for HypervisorError {
    fn from(e: quick_xml::DeError) -> Self {
        HypervisorError::XmlError(e.to_string())
    }
}

impl From<quick_xml::Error> for HypervisorError {
    fn from(e: quick_xml::Error) -> Self {
        HypervisorError::XmlError(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for HypervisorError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        HypervisorError::XmlError(e.to_string())
    }
}

/// Attach operation context to a `Result`.
pub trait ResultExt<T> {
    fn context(self, operation: &'static str, target: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, operation: &'static str, target: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(operation, target))
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display_names_operation_and_target() {
        let err = HypervisorError::NotFound("domain 'web-1'".into())
            .context("start", "web-1");

        assert_eq!(err.to_string(), "start web-1: Not found: domain 'web-1'");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_root_peels_nested_context() {
        let err: Result<()> = Err(HypervisorError::AlreadyExists("vdb".into()));
        let err = err
            .context("attach_disk", "web-1")
            .context("provision", "web-1")
            .unwrap_err();

        assert!(matches!(err.root(), HypervisorError::AlreadyExists(t) if t == "vdb"));
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
    }
}
