//! Error types for nrnscope.
//!
//! All errors are strongly typed using thiserror so callers can pattern match
//! on the exact lifecycle or validation failure.

use thiserror::Error;

use crate::context::ContextId;
use crate::kernel::{KernelCensus, KernelError};

/// Errors raised by the lifecycle contract between wrappers, contexts and the kernel.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Another simulation context ({active}) is already active; finish it before creating another")]
    ConcurrentContext {
        active: ContextId,
    },

    #[error("Kernel is not clean before context creation: {census}")]
    DirtyKernelState {
        census: KernelCensus,
    },

    #[error("Cannot change '{field}' after the context has been initialized")]
    ImmutableAfterInit {
        field: &'static str,
    },

    #[error("Context {context} is already initialized; run() does not accept overrides")]
    AlreadyInitialized {
        context: ContextId,
    },

    #[error("Underlying kernel object of {handle} has already been destroyed")]
    UseAfterDestroy {
        handle: String,
    },

    #[error("Registry and kernel disagree: unknown to context {unknown_to_context:?}, unknown to kernel {unknown_to_kernel:?}")]
    Consistency {
        unknown_to_context: Vec<String>,
        unknown_to_kernel: Vec<String>,
    },

    #[error("Point process '{mechanism}' must be attached to a section before accessing '{attribute}'")]
    AttachmentRequired {
        mechanism: String,
        attribute: String,
    },

    #[error("Simulation context {context} is no longer active")]
    InactiveContext {
        context: ContextId,
    },

    #[error("{handle} belongs to a different simulation context")]
    ContextMismatch {
        handle: String,
    },
}

/// Validation errors for arguments passed to wrappers.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unknown attribute '{attribute}' for mechanism '{mechanism}'")]
    UnknownVariable {
        mechanism: String,
        attribute: String,
    },

    #[error("Unknown mechanism '{name}'")]
    UnknownMechanism {
        name: String,
    },

    #[error("Invalid topology: {reason}")]
    InvalidTopology {
        reason: String,
    },

    #[error("Invalid connection target: {reason}")]
    InvalidConnectionTarget {
        reason: String,
    },

    #[error("Argument '{field}' must be {expected} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        reason: String,
    },

    #[error("Section name '{name}' is already in use")]
    DuplicateName {
        name: String,
    },

    #[error("Invalid section name '{name}'")]
    InvalidName {
        name: String,
    },

    #[error("Index {index} out of bounds for {what} of length {len}")]
    IndexOutOfBounds {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Invalid context configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Top-level error type for nrnscope.
#[derive(Debug, Error)]
pub enum NrnError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl NrnError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a use-after-destroy error for the described handle.
    #[must_use]
    pub fn use_after_destroy(handle: impl Into<String>) -> Self {
        Self::Lifecycle(LifecycleError::UseAfterDestroy {
            handle: handle.into(),
        })
    }

    /// Creates an out-of-range validation error.
    #[must_use]
    pub const fn out_of_range(field: &'static str, value: f64, expected: &'static str) -> Self {
        Self::Validation(ValidationError::OutOfRange {
            field,
            value,
            expected,
        })
    }

    /// Creates an invalid-argument validation error.
    #[must_use]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::Validation(ValidationError::InvalidArgument {
            reason: reason.into(),
        })
    }

    /// Returns true if this is a lifecycle error.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error came from the kernel backend.
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self, Self::Kernel(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the error reports access to an already destroyed handle.
    #[must_use]
    pub const fn is_use_after_destroy(&self) -> bool {
        matches!(self, Self::Lifecycle(LifecycleError::UseAfterDestroy { .. }))
    }
}

/// Result type alias for nrnscope operations.
pub type NrnResult<T> = Result<T, NrnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = NrnError::out_of_range("delay", -1.0, ">= 0");
        let msg = format!("{err}");
        assert!(msg.contains("delay"));
        assert!(msg.contains(">= 0"));
        assert!(msg.contains("-1"));
        assert!(err.is_validation());
    }

    #[test]
    fn test_use_after_destroy() {
        let err = NrnError::use_after_destroy("Section(soma)");
        assert!(err.is_use_after_destroy());
        assert!(err.is_lifecycle());
        assert!(format!("{err}").contains("Section(soma)"));
    }

    #[test]
    fn test_dirty_kernel_lists_counts() {
        let err: NrnError = LifecycleError::DirtyKernelState {
            census: KernelCensus {
                sections: 2,
                connections: 1,
                event_objects: 0,
            },
        }
        .into();
        let msg = format!("{err}");
        assert!(msg.contains("2 section(s)"));
        assert!(msg.contains("1 connection(s)"));
    }

    #[test]
    fn test_kernel_error_conversion() {
        let err: NrnError = KernelError::UnknownVariable {
            name: "gkbar_hh".to_string(),
        }
        .into();
        assert!(err.is_kernel());
        assert!(!err.is_internal());
    }

    #[test]
    fn test_internal() {
        let err = NrnError::internal("count did not decrease");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("count did not decrease"));
    }
}
