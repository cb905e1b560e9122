//! Error types shared by every stage of operator translation.
//!
//! Errors fall into three families: validation problems detected before
//! any GPU object is touched, failures while creating GPU objects, and
//! failures reported by the GPU while a dispatch is in flight.  None of
//! them are retried internally.

use thiserror::Error;

/// Failures of the shape and padding resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("stride must be non-zero")]
    ZeroStride,

    #[error("dilation must be non-zero")]
    ZeroDilation,

    #[error("{what} must be non-zero")]
    ZeroDimension { what: &'static str },

    /// The effective filter extent does not fit inside the (padded) input.
    #[error("filter extent {filter_extent} exceeds input extent {input} (output would be non-positive)")]
    NonPositiveOutput { input: u32, filter_extent: u32 },

    #[error("explicit padding has no implicit output formula; supply the pad amounts")]
    ExplicitNeedsPads,

    #[error("{what}: expected {expected}, got {actual}")]
    Mismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    /// An extent derived from operand values does not fit in 32 bits.
    #[error("{what} overflows a 32-bit extent")]
    Overflow { what: &'static str },

    #[error("{what} buffer holds {actual} elements, shape needs {required}")]
    BufferTooSmall {
        what: &'static str,
        required: u64,
        actual: u64,
    },
}

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any GPU resource was allocated.
    Validation,
    /// A shader module, pipeline, layout or buffer could not be created.
    ResourceCreation,
    /// The GPU reported a fault while executing or waiting on a submission.
    Execution,
    /// No usable adapter or device.
    Device,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{operation} expects {expected} inputs, got {actual}")]
    Arity {
        operation: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("{operation} expects {expected} outputs, got {actual}")]
    OutputArity {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported padding scheme code {0}")]
    UnsupportedPadding(u32),

    #[error("unsupported activation code {0}")]
    UnsupportedActivation(u32),

    #[error("unsupported operation {0}")]
    UnsupportedOperation(String),

    #[error("operand {0} does not exist")]
    MissingOperand(u32),

    #[error("operand {id}: {reason}")]
    InvalidOperand { id: u32, reason: String },

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("invalid dispatch configuration: {0}")]
    Configuration(String),

    /// A built instance refused a bind or dispatch request.  Reaching this
    /// means the caller bypassed the dispatch plan.
    #[error("dispatch refused: {0}")]
    Refused(String),

    #[error("failed to create {stage}: {message}")]
    ResourceCreation { stage: &'static str, message: String },

    #[error("dispatch failed: {0}")]
    Execution(String),

    #[error("operator instance '{0}' is unusable after a resource-creation failure")]
    Poisoned(String),

    #[error("GPU device unavailable: {0}")]
    Device(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::ResourceCreation { .. } | DispatchError::Poisoned(_) => {
                ErrorKind::ResourceCreation
            }
            DispatchError::Execution(_) | DispatchError::Refused(_) => ErrorKind::Execution,
            DispatchError::Device(_) => ErrorKind::Device,
            _ => ErrorKind::Validation,
        }
    }

    pub(crate) fn invalid_operand(id: u32, reason: impl Into<String>) -> Self {
        DispatchError::InvalidOperand {
            id,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
