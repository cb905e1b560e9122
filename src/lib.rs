//! Offload neural-network operators to the GPU through
//! [wgpu](https://github.com/gfx-rs/wgpu) compute pipelines.
//!
//! An inference runtime hands over one operator at a time: its kind, the
//! operand identifiers it reads and writes, and an [`OperandStore`] holding
//! shapes, device buffers and inlined scalar parameters.  The engine
//! resolves output shapes and padding, specialises a precompiled kernel
//! for the operator's exact geometry, compiles it once per operator
//! instance, and issues as many dispatches as the device's group-count
//! limits require.  Execution is synchronous: every submission is waited
//! on before the next one is recorded, and an operator only reports
//! success once its output buffer has been written.
//!
//! The GPU is reached through the [`ComputeDevice`] trait, implemented for
//! [`GpuContext`].

pub mod backend;
pub mod buffer;
pub mod compute;
pub mod config;
pub mod context;
pub mod conv;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod operand;
pub mod padding;
pub mod payload;
pub mod shape;

// Re-export the most common types at the crate root so that users can
// simply `use gpgpu_dispatch::*;`.
pub use backend::{DispatchBackend, PipelineStatus};
pub use buffer::GpuBuffer;
pub use config::{DeviceLimits, TuningConfig};
pub use context::GpuContext;
pub use conv::{conv2d_host, Activation, ConvGeometry, ConvParams, ConvSummary, ConvTranslator};
pub use device::{ComputeDevice, KernelBlob, KernelSource};
pub use dispatch::{DispatchPlan, Partition};
pub use error::{DispatchError, ErrorKind, Result, ShapeError};
pub use executor::GpuExecutor;
pub use operand::{Operand, OperandStore, OperandValue, Operation, OperationType, ScalarValue};
pub use padding::{AxisPadding, PaddingScheme};
pub use payload::{PushPayload, SpecializationPayload};
pub use shape::{Shape, ShapeIdx};
