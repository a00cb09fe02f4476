use thiserror::Error;

/// A3S Ctr error types
#[derive(Error, Debug)]
pub enum CtrError {
    /// I/O failure with the operation that was being attempted
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Network or address management error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Image store or layer error
    #[error("Image error: {0}")]
    ImageError(String),

    /// Archive entry that would land outside the extraction root
    #[error("Path traversal rejected: {entry}")]
    PathTraversal { entry: String },

    /// Namespace or process isolation error
    #[error("Namespace error: {0}")]
    NamespaceError(String),

    /// Cgroup error
    #[error("Cgroup error: {0}")]
    CgroupError(String),

    /// The host lacks a kernel facility the operation needs
    #[error("{capability} is not supported: {reason}")]
    Unsupported { capability: String, reason: String },

    /// Missing container, image or volume
    #[error("{kind} '{reference}' not found")]
    NotFound { kind: String, reference: String },

    /// Name or tag already taken
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed user input
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A short reference matched more than one record
    #[error("Ambiguous reference '{reference}' matches: {}", .matches.join(", "))]
    AmbiguousReference {
        reference: String,
        matches: Vec<String>,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CtrError {
    /// Build a closure that wraps an [`std::io::Error`] with context.
    ///
    /// ```
    /// use a3s_ctr_core::error::CtrError;
    /// let err = std::fs::read("/nonexistent/a3s").map_err(CtrError::io("read config"));
    /// assert!(err.unwrap_err().to_string().starts_with("read config:"));
    /// ```
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> CtrError {
        let context = context.into();
        move |source| CtrError::Io { context, source }
    }

    pub fn not_found(kind: &str, reference: &str) -> Self {
        CtrError::NotFound {
            kind: kind.to_string(),
            reference: reference.to_string(),
        }
    }

    pub fn unsupported(capability: &str, reason: impl Into<String>) -> Self {
        CtrError::Unsupported {
            capability: capability.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the caller's input rather than the host.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CtrError::NotFound { .. }
                | CtrError::Conflict(_)
                | CtrError::Validation(_)
                | CtrError::AmbiguousReference { .. }
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, CtrError::Unsupported { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CtrError::NotFound { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        if self.is_user_error() {
            2
        } else if self.is_unsupported() {
            3
        } else {
            1
        }
    }
}

impl From<serde_json::Error> for CtrError {
    fn from(err: serde_json::Error) -> Self {
        CtrError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CtrError {
    fn from(err: serde_yaml::Error) -> Self {
        CtrError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S Ctr operations
pub type Result<T> = std::result::Result<T, CtrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_context_display() {
        let error = CtrError::Io {
            context: "failed to write /tmp/x".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(error.to_string(), "failed to write /tmp/x: denied");
    }

    #[test]
    fn test_io_helper_wraps_source() {
        let err = std::fs::read("/nonexistent/a3s-ctr/file")
            .map_err(CtrError::io("read state"))
            .unwrap_err();
        match err {
            CtrError::Io { context, source } => {
                assert_eq!(context, "read state");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_registry_error_display() {
        let error = CtrError::RegistryError {
            registry: "registry-1.docker.io".to_string(),
            message: "unauthorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: registry-1.docker.io - unauthorized"
        );
    }

    #[test]
    fn test_not_found_display() {
        let error = CtrError::not_found("image", "demo:v1");
        assert_eq!(error.to_string(), "image 'demo:v1' not found");
        assert!(error.is_not_found());
    }

    #[test]
    fn test_unsupported_display() {
        let error = CtrError::unsupported("cgroups", "no cgroup v1 hierarchy at /sys/fs/cgroup");
        assert_eq!(
            error.to_string(),
            "cgroups is not supported: no cgroup v1 hierarchy at /sys/fs/cgroup"
        );
        assert!(error.is_unsupported());
    }

    #[test]
    fn test_ambiguous_display() {
        let error = CtrError::AmbiguousReference {
            reference: "ab".to_string(),
            matches: vec!["abc".to_string(), "abd".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "Ambiguous reference 'ab' matches: abc, abd"
        );
    }

    #[test]
    fn test_path_traversal_display() {
        let error = CtrError::PathTraversal {
            entry: "../../etc/passwd".to_string(),
        };
        assert_eq!(error.to_string(), "Path traversal rejected: ../../etc/passwd");
    }

    #[test]
    fn test_user_errors_classified() {
        assert!(CtrError::Conflict("name taken".into()).is_user_error());
        assert!(CtrError::Validation("bad memory".into()).is_user_error());
        assert!(CtrError::not_found("container", "x").is_user_error());
        assert!(!CtrError::CgroupError("write failed".into()).is_user_error());
        assert!(!CtrError::unsupported("ipam", "macos").is_user_error());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CtrError::Validation("x".into()).exit_code(), 2);
        assert_eq!(CtrError::unsupported("namespaces", "x").exit_code(), 3);
        assert_eq!(CtrError::Other("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: CtrError = io_err.into();
        assert!(matches!(error, CtrError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid").unwrap_err();
        let error: CtrError = json_err.into();
        assert!(matches!(error, CtrError::SerializationError(_)));
    }

    #[test]
    fn test_from_serde_yaml_error() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("key: [unclosed").unwrap_err();
        let error: CtrError = yaml_err.into();
        assert!(matches!(error, CtrError::SerializationError(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }
        fn returns_err() -> Result<i32> {
            Err(CtrError::Other("test".to_string()))
        }
        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
