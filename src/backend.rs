//! Per-instance pipeline lifecycle and synchronous dispatch.
//!
//! A backend starts [`PipelineState::Uninitialized`].  The first build
//! allocates the binding layout, compiles the kernel with its
//! specialization payload and moves to [`PipelineState::Built`]; later
//! builds are no-ops.  A creation failure moves the backend to
//! [`PipelineState::Failed`] and every later call is refused, since GPU
//! object creation failures are not transient.

use std::sync::Arc;

use crate::config::DeviceLimits;
use crate::device::{ComputeDevice, KernelBlob};
use crate::error::{DispatchError, Result};
use crate::payload::{PushPayload, SpecializationPayload};

pub struct BuiltPipeline<D: ComputeDevice> {
    layout: D::Layout,
    pipeline: D::Pipeline,
    payload: SpecializationPayload,
}

pub enum PipelineState<D: ComputeDevice> {
    Uninitialized,
    Built(BuiltPipeline<D>),
    Failed,
}

/// Observable summary of [`PipelineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Uninitialized,
    Built,
    Failed,
}

pub struct DispatchBackend<D: ComputeDevice> {
    device: Arc<D>,
    label: String,
    operand_count: usize,
    state: PipelineState<D>,
}

impl<D: ComputeDevice> DispatchBackend<D> {
    pub fn new(device: Arc<D>, label: impl Into<String>, operand_count: usize) -> Self {
        DispatchBackend {
            device,
            label: label.into(),
            operand_count,
            state: PipelineState::Uninitialized,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        match self.state {
            PipelineState::Uninitialized => PipelineStatus::Uninitialized,
            PipelineState::Built(_) => PipelineStatus::Built,
            PipelineState::Failed => PipelineStatus::Failed,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limits(&self) -> DeviceLimits {
        self.device.limits()
    }

    pub fn buffer_len(&self, buffer: &D::Buffer) -> usize {
        self.device.buffer_len(buffer)
    }

    /// Payload the pipeline was specialised with, once built.
    pub fn payload(&self) -> Option<&SpecializationPayload> {
        match &self.state {
            PipelineState::Built(built) => Some(&built.payload),
            _ => None,
        }
    }

    /// Build the pipeline unless it already exists.  Returns `true` when
    /// this call performed the build.
    pub fn ensure_built(
        &mut self,
        kernel: &KernelBlob,
        payload: impl FnOnce() -> SpecializationPayload,
    ) -> Result<bool> {
        match self.state {
            PipelineState::Built(_) => return Ok(false),
            PipelineState::Failed => return Err(DispatchError::Poisoned(self.label.clone())),
            PipelineState::Uninitialized => {}
        }

        let payload = payload();
        match self.build(kernel, &payload) {
            Ok((layout, pipeline)) => {
                log::debug!(
                    "{}: built pipeline from '{}' ({} bytes) with payload {:?}",
                    self.label,
                    kernel.label,
                    kernel.len(),
                    payload.fields()
                );
                self.state = PipelineState::Built(BuiltPipeline {
                    layout,
                    pipeline,
                    payload,
                });
                Ok(true)
            }
            Err(e) => {
                log::error!("{}: pipeline creation failed: {e}", self.label);
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    fn build(
        &self,
        kernel: &KernelBlob,
        payload: &SpecializationPayload,
    ) -> Result<(D::Layout, D::Pipeline)> {
        let layout = self.device.create_layout(&self.label, self.operand_count)?;
        let pipeline = self.device.create_pipeline(&layout, kernel, payload)?;
        Ok((layout, pipeline))
    }

    fn built(&self) -> Result<&BuiltPipeline<D>> {
        match &self.state {
            PipelineState::Built(built) => Ok(built),
            PipelineState::Failed => Err(DispatchError::Poisoned(self.label.clone())),
            PipelineState::Uninitialized => Err(DispatchError::Refused(format!(
                "{}: pipeline used before it was built",
                self.label
            ))),
        }
    }

    /// Attach operand buffers to slots `0..operand_count`.
    pub fn bind(&self, buffers: &[&D::Buffer]) -> Result<D::Bindings> {
        let built = self.built()?;
        if buffers.len() != self.operand_count {
            return Err(DispatchError::Refused(format!(
                "{}: expected {} operand buffers, got {}",
                self.label,
                self.operand_count,
                buffers.len()
            )));
        }
        self.device.bind(&built.layout, buffers)
    }

    /// Submit one dispatch and block until it completes.  Group counts
    /// above the device ceiling are refused; callers partition instead.
    pub fn dispatch(&self, bindings: &D::Bindings, push: &PushPayload, groups: [u32; 3]) -> Result<()> {
        let built = self.built()?;
        let max = self.device.limits().max_groups_per_dimension;
        if groups.iter().any(|&g| g == 0 || g > max) {
            return Err(DispatchError::Refused(format!(
                "{}: group counts {groups:?} outside 1..={max}",
                self.label
            )));
        }
        log::trace!("{}: dispatch {groups:?} push {push:?}", self.label);
        self.device
            .submit_and_wait(&built.pipeline, bindings, push, groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::recording::{Event, RecordingDevice};
    use crate::error::ErrorKind;

    fn payload(n: u32) -> SpecializationPayload {
        SpecializationPayload {
            local_size: [1, 16, 1],
            n,
            ..Default::default()
        }
    }

    #[test]
    fn builds_exactly_once() {
        let device = Arc::new(RecordingDevice::default());
        let mut backend = DispatchBackend::new(device.clone(), "conv", 4);
        assert_eq!(backend.status(), PipelineStatus::Uninitialized);

        assert!(backend.ensure_built(&KernelBlob::conv2d(), || payload(4)).unwrap());
        for _ in 0..3 {
            let rebuilt = backend
                .ensure_built(&KernelBlob::conv2d(), || panic!("payload rebuilt"))
                .unwrap();
            assert!(!rebuilt);
        }
        assert_eq!(backend.status(), PipelineStatus::Built);
        assert_eq!(device.pipelines_built(), 1);
        assert_eq!(
            device.events.borrow()[0],
            Event::CreateLayout { operand_count: 4 }
        );
        assert_eq!(backend.payload().map(|p| p.n), Some(4));
    }

    #[test]
    fn creation_failure_poisons_the_instance() {
        let device = Arc::new(RecordingDevice::default());
        device.fail_pipeline.set(true);
        let mut backend = DispatchBackend::new(device.clone(), "conv", 4);

        let err = backend.ensure_built(&KernelBlob::conv2d(), || payload(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceCreation);
        assert_eq!(backend.status(), PipelineStatus::Failed);

        device.fail_pipeline.set(false);
        let err = backend.ensure_built(&KernelBlob::conv2d(), || payload(1)).unwrap_err();
        assert!(matches!(err, DispatchError::Poisoned(_)));
        assert_eq!(device.pipelines_built(), 0);
        assert!(backend.payload().is_none());
    }

    #[test]
    fn dispatch_requires_a_built_pipeline() {
        let device = Arc::new(RecordingDevice::default());
        let backend = DispatchBackend::new(device.clone(), "conv", 4);
        assert!(backend.bind(&[&0, &1, &2, &3]).is_err());
        assert!(device.events.borrow().is_empty());
    }

    #[test]
    fn oversized_groups_are_refused() {
        let limits = DeviceLimits {
            max_groups_per_dimension: 4,
            ..DeviceLimits::reference()
        };
        let device = Arc::new(RecordingDevice::with_limits(limits));
        let mut backend = DispatchBackend::new(device.clone(), "conv", 4);
        backend.ensure_built(&KernelBlob::conv2d(), || payload(1)).unwrap();
        let bindings = backend.bind(&[&0, &1, &2, &3]).unwrap();
        let push = PushPayload::default();

        assert!(backend.dispatch(&bindings, &push, [4, 4, 1]).is_ok());
        let err = backend.dispatch(&bindings, &push, [5, 1, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(backend.dispatch(&bindings, &push, [1, 0, 1]).is_err());
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn bind_checks_operand_count() {
        let device = Arc::new(RecordingDevice::default());
        let mut backend = DispatchBackend::new(device, "conv", 4);
        backend.ensure_built(&KernelBlob::conv2d(), || payload(1)).unwrap();
        assert!(matches!(backend.bind(&[&0, &1, &2]), Err(DispatchError::Refused(_))));
        assert!(backend.bind(&[&0, &1, &2, &3]).is_ok());
    }
}
