//! Error types
//!
//! Every lifecycle phase returns a [`Status`]. Failures are values, never
//! panics, so the graph executor can check each call.

use thiserror::Error;

use crate::ops::OperatorKind;
use crate::sync::LockStatus;

/// Failures raised by the Vulkan backend.
#[derive(Debug, Error)]
pub enum VulkanErrorKind {
    #[error("Failed to load Vulkan entry points: {0}")]
    EntryLoadFailed(String),

    #[error("Vulkan initialization failed: {0}")]
    InitializationFailed(String),

    #[error("No suitable Vulkan device found")]
    NoSuitableDevice,

    #[error("Invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    #[error("Shader module creation failed: {0}")]
    ShaderCreationFailed(String),

    #[error("Compute pipeline creation failed: {0}")]
    PipelineCreationFailed(String),

    #[error("Buffer allocation failed: {0}")]
    BufferAllocationFailed(String),

    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Invalid kernel manifest: {0}")]
    ManifestInvalid(String),
}

/// The FAILURE half of every phase status.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Too few tensors, wrong rank, or a tensor of the wrong type.
    #[error("{kind}: precondition violated: {reason}")]
    Precondition { kind: OperatorKind, reason: String },

    /// No compiled program exists for the composed kernel name.
    #[error("kernel resolution failed for '{name}': {reason}")]
    Resolution { name: String, reason: String },

    /// Output shape cannot be derived from the inputs and parameters.
    #[error("{kind}: shape inference failed: {reason}")]
    ShapeInference { kind: OperatorKind, reason: String },

    /// The queue rejected the arguments or the launch geometry.
    #[error("enqueue of '{kernel}' rejected: {reason}")]
    Enqueue { kernel: String, reason: String },

    /// A kernel failed while running on the queue.
    #[error("kernel '{kernel}' failed: {reason}")]
    Kernel { kernel: String, reason: String },

    /// A phase was called out of order.
    #[error("{kind}: cannot {phase} while {state}")]
    Lifecycle {
        kind: OperatorKind,
        phase: &'static str,
        state: &'static str,
    },

    #[error("parameters for {found} passed to a {expected} operator")]
    ParamMismatch {
        expected: OperatorKind,
        found: OperatorKind,
    },

    #[error("host mutex '{name}': {status}")]
    Sync { name: &'static str, status: LockStatus },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error(transparent)]
    Backend(#[from] VulkanErrorKind),
}

impl RuntimeError {
    pub(crate) fn precondition(kind: OperatorKind, reason: impl Into<String>) -> Self {
        RuntimeError::Precondition {
            kind,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(kind: OperatorKind, reason: impl Into<String>) -> Self {
        RuntimeError::ShapeInference {
            kind,
            reason: reason.into(),
        }
    }

    pub(crate) fn resolution(name: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::Resolution {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn enqueue(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::Enqueue {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn kernel(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::Kernel {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }
}

/// SUCCESS is `Ok(())`.
pub type Status = Result<(), RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_operator() {
        let err = RuntimeError::precondition(OperatorKind::Gather, "expected 2 inputs, got 1");
        let msg = err.to_string();
        assert!(msg.contains("Gather"));
        assert!(msg.contains("expected 2 inputs"));
    }

    #[test]
    fn test_vulkan_errors_convert() {
        let err: RuntimeError = VulkanErrorKind::NoSuitableDevice.into();
        assert!(matches!(err, RuntimeError::Backend(VulkanErrorKind::NoSuitableDevice)));
        assert_eq!(err.to_string(), "No suitable Vulkan device found");
    }
}
