//! The thin interface through which the dispatch engine drives a GPU.
//!
//! Everything below pipeline and command-buffer granularity (instances,
//! adapters, allocators) stays behind this trait.  [`crate::GpuContext`]
//! implements it on top of wgpu.

use std::borrow::Cow;

use crate::config::DeviceLimits;
use crate::error::Result;
use crate::payload::{PushPayload, SpecializationPayload};

/// Encoding of a precompiled compute kernel.
#[derive(Debug, Clone)]
pub enum KernelSource {
    /// SPIR-V words as raw bytes; the length must be a multiple of four.
    SpirV(Cow<'static, [u8]>),
    Wgsl(Cow<'static, str>),
}

/// An opaque compute kernel.  The engine never looks inside; it only hands
/// the blob to pipeline creation.
#[derive(Debug, Clone)]
pub struct KernelBlob {
    pub label: &'static str,
    pub entry_point: &'static str,
    pub source: KernelSource,
}

impl KernelBlob {
    pub fn spirv(label: &'static str, entry_point: &'static str, bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        KernelBlob {
            label,
            entry_point,
            source: KernelSource::SpirV(bytes.into()),
        }
    }

    pub fn wgsl(label: &'static str, entry_point: &'static str, text: impl Into<Cow<'static, str>>) -> Self {
        KernelBlob {
            label,
            entry_point,
            source: KernelSource::Wgsl(text.into()),
        }
    }

    /// NHWC convolution kernel shipped with the crate.  Filters are laid
    /// out as `[out_channels, height, width, in_channels]`.
    pub fn conv2d() -> Self {
        Self::wgsl("conv2d", "main", include_str!("shaders/conv2d.wgsl"))
    }

    pub fn len(&self) -> usize {
        match &self.source {
            KernelSource::SpirV(bytes) => bytes.len(),
            KernelSource::Wgsl(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pipeline-level operations of a compute API.
///
/// Each operator instance owns one layout and one pipeline; bindings are
/// recreated per invocation.  `submit_and_wait` must not return before the
/// GPU has finished the submission.
pub trait ComputeDevice {
    type Buffer;
    type Layout;
    type Pipeline;
    type Bindings;

    fn limits(&self) -> DeviceLimits;

    /// Number of elements `buffer` can hold.
    fn buffer_len(&self, buffer: &Self::Buffer) -> usize;

    /// Allocate the binding layout for `operand_count` storage buffers plus
    /// the per-submission push block.
    fn create_layout(&self, label: &str, operand_count: usize) -> Result<Self::Layout>;

    fn create_pipeline(
        &self,
        layout: &Self::Layout,
        kernel: &KernelBlob,
        payload: &SpecializationPayload,
    ) -> Result<Self::Pipeline>;

    /// Attach operand buffers to slots `0..buffers.len()`.
    fn bind(&self, layout: &Self::Layout, buffers: &[&Self::Buffer]) -> Result<Self::Bindings>;

    /// Record one dispatch of `groups`, submit it and block until it has
    /// completed.
    fn submit_and_wait(
        &self,
        pipeline: &Self::Pipeline,
        bindings: &Self::Bindings,
        push: &PushPayload,
        groups: [u32; 3],
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod recording {
    //! A device that records calls instead of talking to a GPU.

    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::*;
    use crate::error::DispatchError;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        CreateLayout { operand_count: usize },
        CreatePipeline { payload: SpecializationPayload },
        Bind { buffers: Vec<u32> },
        Submit { push: PushPayload, groups: [u32; 3] },
    }

    #[derive(Debug, Default)]
    pub struct RecordingDevice {
        pub limits: Option<DeviceLimits>,
        pub events: RefCell<Vec<Event>>,
        pub fail_pipeline: Cell<bool>,
        pub fail_submit_at: Cell<Option<usize>>,
        /// Element counts of buffer ids; ids without an entry are unbounded.
        pub buffer_lens: RefCell<HashMap<u32, usize>>,
        submits: Cell<usize>,
    }

    impl RecordingDevice {
        pub fn with_limits(limits: DeviceLimits) -> Self {
            RecordingDevice {
                limits: Some(limits),
                ..Default::default()
            }
        }

        pub fn set_buffer_len(&self, id: u32, len: usize) {
            self.buffer_lens.borrow_mut().insert(id, len);
        }

        pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events.borrow().iter().filter(|e| pred(e)).count()
        }

        pub fn pipelines_built(&self) -> usize {
            self.count(|e| matches!(e, Event::CreatePipeline { .. }))
        }

        pub fn submissions(&self) -> Vec<(PushPayload, [u32; 3])> {
            self.events
                .borrow()
                .iter()
                .filter_map(|e| match e {
                    Event::Submit { push, groups } => Some((*push, *groups)),
                    _ => None,
                })
                .collect()
        }
    }

    impl ComputeDevice for RecordingDevice {
        type Buffer = u32;
        type Layout = usize;
        type Pipeline = SpecializationPayload;
        type Bindings = Vec<u32>;

        fn limits(&self) -> DeviceLimits {
            self.limits.unwrap_or_default()
        }

        fn buffer_len(&self, buffer: &u32) -> usize {
            self.buffer_lens.borrow().get(buffer).copied().unwrap_or(usize::MAX)
        }

        fn create_layout(&self, _label: &str, operand_count: usize) -> Result<usize> {
            self.events
                .borrow_mut()
                .push(Event::CreateLayout { operand_count });
            Ok(operand_count)
        }

        fn create_pipeline(
            &self,
            _layout: &usize,
            _kernel: &KernelBlob,
            payload: &SpecializationPayload,
        ) -> Result<SpecializationPayload> {
            if self.fail_pipeline.get() {
                return Err(DispatchError::ResourceCreation {
                    stage: "compute pipeline",
                    message: "injected failure".into(),
                });
            }
            self.events
                .borrow_mut()
                .push(Event::CreatePipeline { payload: *payload });
            Ok(*payload)
        }

        fn bind(&self, layout: &usize, buffers: &[&u32]) -> Result<Vec<u32>> {
            assert_eq!(*layout, buffers.len());
            let ids: Vec<u32> = buffers.iter().map(|b| **b).collect();
            self.events
                .borrow_mut()
                .push(Event::Bind { buffers: ids.clone() });
            Ok(ids)
        }

        fn submit_and_wait(
            &self,
            _pipeline: &SpecializationPayload,
            _bindings: &Vec<u32>,
            push: &PushPayload,
            groups: [u32; 3],
        ) -> Result<()> {
            let index = self.submits.get();
            self.submits.set(index + 1);
            if self.fail_submit_at.get() == Some(index) {
                return Err(DispatchError::Execution("injected device fault".into()));
            }
            self.events.borrow_mut().push(Event::Submit {
                push: *push,
                groups,
            });
            Ok(())
        }
    }
}
