//! Error types for resource group operations

use std::io;
use thiserror::Error;

/// Result type for resource group operations
pub type Result<T> = std::result::Result<T, GroupError>;

/// Errors that can occur while managing a resource group
#[derive(Error, Debug)]
pub enum GroupError {
    /// An OS call against the group failed. `source` carries the raw OS error code.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource group '{0}' already exists")]
    AlreadyExists(String),

    #[error("Resource group '{0}' does not exist")]
    NotFound(String),

    #[error("Resource group '{0}' has not been materialized")]
    NotMaterialized(String),

    #[error("Could not retrieve limits for resource group '{0}'")]
    LimitQuery(String),

    #[error("Failed to launch process: {0}")]
    Launch(String),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl GroupError {
    /// Wrap an OS error with the name of the failing operation
    pub fn os(op: &'static str, source: io::Error) -> Self {
        GroupError::Os { op, source }
    }

    /// Raw OS error code, when the error came from the OS
    pub fn os_code(&self) -> Option<i32> {
        match self {
            GroupError::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GroupError::AlreadyExists("managed".to_string());
        assert_eq!(err.to_string(), "Resource group 'managed' already exists");
    }

    #[test]
    fn test_os_error_keeps_source() {
        use std::error::Error as _;
        let err = GroupError::os("read cgroup.procs", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.source().is_some());
        assert_eq!(err.os_code(), None);
    }

    #[test]
    fn test_os_error_names_operation_and_code() {
        let err = GroupError::os("write memory.max", io::Error::from_raw_os_error(libc::EACCES));
        let msg = err.to_string();
        assert!(msg.starts_with("write memory.max failed"));
        assert!(msg.contains(&format!("os error {}", libc::EACCES)));
        assert_eq!(err.os_code(), Some(libc::EACCES));
    }

    #[test]
    fn test_os_code_absent_for_logic_errors() {
        assert_eq!(GroupError::NotMaterialized("x".into()).os_code(), None);
        assert_eq!(GroupError::LimitQuery("x".into()).os_code(), None);
    }

    #[test]
    fn test_result_error() {
        fn returns_error() -> Result<i32> {
            Err(GroupError::NotFound("missing".to_string()))
        }
        assert!(returns_error().is_err());
    }
}
