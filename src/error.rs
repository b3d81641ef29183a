//! Central error types for the composition layer.
//!
//! Every fallible operation returns [`LayerResult`]. Errors are classified into
//! a small set of [`ErrorKind`]s so that the intercepted-call boundary can decide
//! how to report them, and [`LayerError::to_xr_result`] turns them into the
//! runtime's generic failure codes.

use openxr_sys as xr;
use thiserror::Error;

/// Main error type for layer operations.
#[derive(Error, Debug)]
pub enum LayerError {
    /// The device cannot satisfy a resource request
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// A resource created on another device could not be opened
    #[error("Import failed: {0}")]
    Import(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A non-blocking acquire found no free image
    #[error("No free image available in swapchain ({0})")]
    Busy(String),

    /// Session or resource lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// A second instance of a process-wide singleton was requested
    #[error("duplicate factory")]
    DuplicateInstance,

    /// A resource from one graphics API was handed to a device of another
    #[error("Graphics API mismatch: expected {expected}, got {actual}")]
    ApiMismatch { expected: String, actual: String },

    /// An operation was invoked out of its required order
    #[error("Invalid call order: {0}")]
    InvalidCallOrder(String),

    /// The GPU device was removed or reset
    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    /// The underlying runtime returned a failure
    #[error("Runtime call {call} failed: {result:?}")]
    Runtime {
        call: &'static str,
        result: xr::Result,
    },

    /// File access failed
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Coarse error classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    Import,
    Configuration,
    Busy,
    NotFound,
}

impl LayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LayerError::Allocation(_) | LayerError::DeviceLost(_) | LayerError::Runtime { .. } => {
                ErrorKind::Allocation
            },
            LayerError::Import(_) | LayerError::ApiMismatch { .. } => ErrorKind::Import,
            LayerError::Busy(_) => ErrorKind::Busy,
            LayerError::NotFound(_) => ErrorKind::NotFound,
            LayerError::Configuration(_)
            | LayerError::DuplicateInstance
            | LayerError::InvalidCallOrder(_)
            | LayerError::Io(_)
            | LayerError::Json(_)
            | LayerError::Other(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the caller may retry the operation.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }

    /// Translate into the result code returned from an intercepted entry point.
    pub fn to_xr_result(&self) -> xr::Result {
        match self {
            LayerError::Runtime { result, .. } => *result,
            LayerError::NotFound(_) => xr::Result::ERROR_HANDLE_INVALID,
            LayerError::Busy(_) | LayerError::InvalidCallOrder(_) => {
                xr::Result::ERROR_CALL_ORDER_INVALID
            },
            LayerError::Allocation(_) => xr::Result::ERROR_OUT_OF_MEMORY,
            _ => xr::Result::ERROR_RUNTIME_FAILURE,
        }
    }

    pub(crate) fn api_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        LayerError::ApiMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<String> for LayerError {
    fn from(msg: String) -> Self {
        LayerError::Other(msg)
    }
}

impl From<&str> for LayerError {
    fn from(msg: &str) -> Self {
        LayerError::Other(msg.to_string())
    }
}

/// Check a runtime result code, turning failures into [`LayerError::Runtime`].
pub fn check_xr(call: &'static str, result: xr::Result) -> LayerResult<()> {
    if result.into_raw() >= 0 {
        Ok(())
    } else {
        Err(LayerError::Runtime { call, result })
    }
}

/// Extension trait for adding context to Results.
///
/// Similar to anyhow's `Context` trait, this allows chaining context
/// information onto foreign errors (OS, runtime, driver) for better debugging.
///
/// # Example
/// ```ignore
/// use crate::error::{ResultExt, LayerResult};
///
/// fn load_settings() -> LayerResult<String> {
///     std::fs::read_to_string("settings.cfg").context("failed to read settings file")
/// }
/// ```
pub trait ResultExt<T> {
    /// Add context to an error, converting it to LayerError::Other.
    fn context(self, msg: &str) -> LayerResult<T>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F: FnOnce() -> String>(self, f: F) -> LayerResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn context(self, msg: &str) -> LayerResult<T> {
        self.map_err(|e| LayerError::Other(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> LayerResult<T> {
        self.map_err(|e| LayerError::Other(format!("{}: {}", f(), e)))
    }
}

/// Extension trait for adding context to Option types.
pub trait OptionExt<T> {
    /// Convert None to LayerError::NotFound with the given message.
    fn context(self, msg: &str) -> LayerResult<T>;

    /// Convert None to LayerError::NotFound with a lazily evaluated message.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> LayerResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context(self, msg: &str) -> LayerResult<T> {
        self.ok_or_else(|| LayerError::NotFound(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> LayerResult<T> {
        self.ok_or_else(|| LayerError::NotFound(f()))
    }
}

/// Type alias for Results using LayerError.
pub type LayerResult<T> = Result<T, LayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LayerError::Allocation("R8G8B8A8 1024x1024".to_string());
        assert_eq!(err.to_string(), "Allocation failed: R8G8B8A8 1024x1024");
    }

    #[test]
    fn test_duplicate_instance_is_configuration() {
        let err = LayerError::DuplicateInstance;
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.to_string(), "duplicate factory");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(LayerError::Busy("x".into()).kind(), ErrorKind::Busy);
        assert_eq!(LayerError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(LayerError::Import("x".into()).kind(), ErrorKind::Import);
        assert_eq!(
            LayerError::api_mismatch("Software", "Wgpu").kind(),
            ErrorKind::Import
        );
        assert_eq!(LayerError::DeviceLost("x".into()).kind(), ErrorKind::Allocation);
        assert_eq!(
            LayerError::InvalidCallOrder("x".into()).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_only_busy_is_recoverable() {
        assert!(LayerError::Busy("x".into()).is_recoverable());
        assert!(!LayerError::Allocation("x".into()).is_recoverable());
        assert!(!LayerError::NotFound("x".into()).is_recoverable());
    }

    #[test]
    fn test_xr_result_translation() {
        assert_eq!(
            LayerError::NotFound("session".into()).to_xr_result(),
            xr::Result::ERROR_HANDLE_INVALID
        );
        assert_eq!(
            LayerError::Busy("x".into()).to_xr_result(),
            xr::Result::ERROR_CALL_ORDER_INVALID
        );
        assert_eq!(
            LayerError::Allocation("x".into()).to_xr_result(),
            xr::Result::ERROR_OUT_OF_MEMORY
        );
        assert_eq!(
            LayerError::DeviceLost("x".into()).to_xr_result(),
            xr::Result::ERROR_RUNTIME_FAILURE
        );
        let runtime = LayerError::Runtime {
            call: "xrCreateSwapchain",
            result: xr::Result::ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED,
        };
        assert_eq!(
            runtime.to_xr_result(),
            xr::Result::ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED
        );
    }

    #[test]
    fn test_check_xr() {
        assert!(check_xr("xrWaitSwapchainImage", xr::Result::SUCCESS).is_ok());
        assert!(check_xr("xrWaitSwapchainImage", xr::Result::TIMEOUT_EXPIRED).is_ok());
        let err = check_xr("xrWaitSwapchainImage", xr::Result::ERROR_RUNTIME_FAILURE).unwrap_err();
        assert!(err.to_string().contains("xrWaitSwapchainImage"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LayerError = io_err.into();
        assert!(matches!(err, LayerError::Io(_)));
    }

    #[test]
    fn test_from_string() {
        let err: LayerError = "test error".into();
        assert!(matches!(err, LayerError::Other(_)));
    }

    #[test]
    fn test_result_ext_context() {
        let result: Result<(), &str> = Err("original error");
        let with_context = result.context("operation failed");

        assert!(matches!(with_context, Err(LayerError::Other(_))));
        let msg = with_context.unwrap_err().to_string();
        assert!(msg.contains("operation failed"));
        assert!(msg.contains("original error"));
    }

    #[test]
    fn test_result_ext_with_context() {
        let result: Result<(), &str> = Err("inner");
        let with_context = result.with_context(|| format!("ctx-{}", 42));

        let msg = with_context.unwrap_err().to_string();
        assert!(msg.contains("ctx-42"));
        assert!(msg.contains("inner"));
    }

    #[test]
    fn test_option_ext_context() {
        let opt: Option<i32> = None;
        let result = opt.context("value was missing");

        assert!(matches!(result, Err(LayerError::NotFound(_))));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("value was missing"));
    }

    #[test]
    fn test_option_ext_some_passthrough() {
        let opt: Option<i32> = Some(42);
        let result = opt.context("should not appear");

        assert_eq!(result.unwrap(), 42);
    }
}
