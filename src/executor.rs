//! Routes model operations to per-instance translators.
//!
//! Each operation index of a model gets its own translator, and with it
//! its own pipeline, so two convolutions with the same geometry still
//! compile separately.  Operations run one at a time, each blocking until
//! its GPU work has completed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::PipelineStatus;
use crate::config::TuningConfig;
use crate::conv::{ConvSummary, ConvTranslator};
use crate::device::{ComputeDevice, KernelBlob};
use crate::error::{DispatchError, Result};
use crate::operand::{OperandStore, Operation, OperationType};

pub struct GpuExecutor<D: ComputeDevice> {
    device: Arc<D>,
    tuning: TuningConfig,
    kernels: HashMap<OperationType, KernelBlob>,
    conv: HashMap<usize, ConvTranslator<D>>,
}

impl<D: ComputeDevice> GpuExecutor<D> {
    /// Executor using the bundled convolution kernel and tuning taken from
    /// the environment.
    pub fn new(device: Arc<D>) -> Self {
        let mut kernels = HashMap::new();
        kernels.insert(OperationType::Conv2d, KernelBlob::conv2d());
        GpuExecutor {
            device,
            tuning: TuningConfig::from_env(),
            kernels,
            conv: HashMap::new(),
        }
    }

    /// Applies to translators created after this call.
    pub fn with_tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    /// Replace the kernel used for `kind`, e.g. with a precompiled SPIR-V
    /// blob.
    pub fn with_kernel(mut self, kind: OperationType, kernel: KernelBlob) -> Self {
        self.kernels.insert(kind, kernel);
        self
    }

    pub fn instance_count(&self) -> usize {
        self.conv.len()
    }

    pub fn status(&self, index: usize) -> Option<PipelineStatus> {
        self.conv.get(&index).map(ConvTranslator::status)
    }

    /// Drop the translator of `index`; the next execution builds a fresh
    /// one.  This is how an instance recovers from a creation failure.
    pub fn discard(&mut self, index: usize) -> bool {
        self.conv.remove(&index).is_some()
    }

    /// Execute operation `index` of the model.
    pub fn execute(
        &mut self,
        index: usize,
        operation: &Operation,
        operands: &mut OperandStore<D::Buffer>,
    ) -> Result<ConvSummary> {
        match operation.kind {
            OperationType::Conv2d => {
                let translator = match self.conv.entry(index) {
                    std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let kernel = self
                            .kernels
                            .get(&operation.kind)
                            .cloned()
                            .ok_or_else(|| DispatchError::UnsupportedOperation(operation.kind.to_string()))?;
                        log::debug!("creating translator for {} #{index}", operation.kind);
                        entry.insert(ConvTranslator::new(
                            self.device.clone(),
                            format!("conv2d#{index}"),
                            kernel,
                            self.tuning,
                        ))
                    }
                };
                translator.execute(operation, operands)
            }
            OperationType::Other(_) => Err(DispatchError::UnsupportedOperation(operation.kind.to_string())),
        }
    }

    /// Execute `operations` in order, stopping at the first failure.
    pub fn run(&mut self, operations: &[Operation], operands: &mut OperandStore<D::Buffer>) -> Result<u64> {
        let mut submissions = 0;
        for (index, operation) in operations.iter().enumerate() {
            submissions += self.execute(index, operation, operands)?.submissions;
        }
        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::recording::RecordingDevice;
    use crate::operand::ScalarValue;
    use crate::shape::Shape;

    fn two_layer_model() -> (OperandStore<u32>, Vec<Operation>) {
        let mut store = OperandStore::new();
        let input = store.add_buffer(Shape::new(1, 8, 8, 1), 0);
        let f1 = store.add_buffer(Shape::new(2, 3, 3, 1), 1);
        let b1 = store.add_buffer(Shape::new(1, 1, 1, 2), 2);
        let valid = store.add_scalar(ScalarValue::UInt32(2));
        let one = store.add_scalar(ScalarValue::UInt32(1));
        let none = store.add_scalar(ScalarValue::UInt32(0));
        let mid = store.add_buffer(Shape::unresolved(), 3);
        let f2 = store.add_buffer(Shape::new(2, 3, 3, 2), 4);
        let b2 = store.add_buffer(Shape::new(1, 1, 1, 2), 5);
        let out = store.add_buffer(Shape::unresolved(), 6);
        let ops = vec![
            Operation::new(OperationType::Conv2d, vec![input, f1, b1, valid, one, one, none], vec![mid]),
            Operation::new(OperationType::Conv2d, vec![mid, f2, b2, valid, one, one, none], vec![out]),
        ];
        (store, ops)
    }

    #[test]
    fn each_operation_gets_its_own_pipeline() {
        let device = Arc::new(RecordingDevice::default());
        let mut executor = GpuExecutor::new(device.clone()).with_tuning(TuningConfig::conv_default());
        let (mut store, ops) = two_layer_model();

        let submissions = executor.run(&ops, &mut store).unwrap();
        assert_eq!(store.get(ops[1].outputs[0]).unwrap().shape, Shape::new(1, 4, 4, 2));
        assert_eq!(submissions, 4);
        assert_eq!(executor.instance_count(), 2);

        executor.run(&ops, &mut store).unwrap();
        assert_eq!(device.pipelines_built(), 2);
        assert_eq!(executor.status(0), Some(PipelineStatus::Built));
    }

    #[test]
    fn unsupported_kinds_are_rejected() {
        let device = Arc::new(RecordingDevice::default());
        let mut executor = GpuExecutor::new(device.clone());
        let mut store = OperandStore::new();
        let op = Operation::new(OperationType::Other(17), vec![], vec![]);
        let err = executor.execute(0, &op, &mut store).unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedOperation(_)));
        assert_eq!(executor.instance_count(), 0);
    }

    #[test]
    fn discarding_recovers_a_failed_instance() {
        let device = Arc::new(RecordingDevice::default());
        let mut executor = GpuExecutor::new(device.clone()).with_tuning(TuningConfig::conv_default());
        let (mut store, ops) = two_layer_model();

        device.fail_pipeline.set(true);
        assert!(executor.execute(0, &ops[0], &mut store).is_err());
        device.fail_pipeline.set(false);
        assert!(matches!(
            executor.execute(0, &ops[0], &mut store),
            Err(DispatchError::Poisoned(_))
        ));
        assert_eq!(executor.status(0), Some(PipelineStatus::Failed));

        assert!(executor.discard(0));
        assert!(executor.execute(0, &ops[0], &mut store).is_ok());
        assert_eq!(device.pipelines_built(), 1);
    }
}
