//! CONV_2D translation: operands in, partitioned dispatches out.
//!
//! Operand layout (NHWC tensors, filters `[out_c, h, w, in_c]`):
//!
//! | index | explicit form (10)  | implicit form (7) |
//! |-------|---------------------|-------------------|
//! | 0     | input               | input             |
//! | 1     | filter              | filter            |
//! | 2     | bias `[out_c]`      | bias              |
//! | 3     | pad left            | padding code      |
//! | 4     | pad right           | stride width      |
//! | 5     | pad top             | stride height     |
//! | 6     | pad bottom          | activation        |
//! | 7     | stride width        |                   |
//! | 8     | stride height       |                   |
//! | 9     | activation          |                   |

use std::sync::Arc;

use crate::backend::{DispatchBackend, PipelineStatus};
use crate::config::TuningConfig;
use crate::device::{ComputeDevice, KernelBlob};
use crate::dispatch::DispatchPlan;
use crate::error::{DispatchError, Result, ShapeError};
use crate::operand::{OperandStore, Operation, OperationType};
use crate::padding::{self, AxisPadding, PaddingScheme};
use crate::payload::{conv_local_size, SpecializationPayload};
use crate::shape::Shape;

/// Buffers bound per dispatch: input, filter, bias, output.
pub const CONV_OPERAND_COUNT: usize = 4;
pub const EXPLICIT_PADDING_ARITY: usize = 10;
pub const IMPLICIT_PADDING_ARITY: usize = 7;

const OPERATION: &str = "CONV_2D";

/// Activation fused into the convolution output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    None = 0,
    Relu = 1,
    /// Clamp to `[-1, 1]`.
    Relu1 = 2,
    Relu6 = 3,
}

impl Activation {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Activation::None),
            1 => Ok(Activation::Relu),
            2 => Ok(Activation::Relu1),
            3 => Ok(Activation::Relu6),
            other => Err(DispatchError::UnsupportedActivation(other)),
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn apply(self, value: f32) -> f32 {
        match self {
            Activation::None => value,
            Activation::Relu => value.max(0.0),
            Activation::Relu1 => value.clamp(-1.0, 1.0),
            Activation::Relu6 => value.clamp(0.0, 6.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvPadding {
    Explicit {
        left: u32,
        right: u32,
        top: u32,
        bottom: u32,
    },
    Implicit(PaddingScheme),
}

/// Scalar parameters of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    pub padding: ConvPadding,
    pub stride_w: u32,
    pub stride_h: u32,
    pub activation: Activation,
}

impl ConvParams {
    /// Read the scalar operands of either operand form.
    pub fn from_operands<B>(inputs: &[u32], operands: &OperandStore<B>) -> Result<Self> {
        let scalar = |slot: usize| operands.get(inputs[slot])?.scalar_u32();
        match inputs.len() {
            EXPLICIT_PADDING_ARITY => Ok(ConvParams {
                padding: ConvPadding::Explicit {
                    left: scalar(3)?,
                    right: scalar(4)?,
                    top: scalar(5)?,
                    bottom: scalar(6)?,
                },
                stride_w: scalar(7)?,
                stride_h: scalar(8)?,
                activation: Activation::from_code(scalar(9)?)?,
            }),
            IMPLICIT_PADDING_ARITY => Ok(ConvParams {
                padding: ConvPadding::Implicit(PaddingScheme::from_code(scalar(3)?)?),
                stride_w: scalar(4)?,
                stride_h: scalar(5)?,
                activation: Activation::from_code(scalar(6)?)?,
            }),
            actual => Err(DispatchError::Arity {
                operation: OPERATION,
                expected: "7 or 10",
                actual,
            }),
        }
    }

    /// Scheme used to validate the output extent; explicit pads are
    /// classified by their leading edges.
    pub fn scheme(&self) -> PaddingScheme {
        match self.padding {
            ConvPadding::Explicit { left, top, .. } => PaddingScheme::classify_explicit(left, top),
            ConvPadding::Implicit(scheme) => scheme,
        }
    }
}

/// Fully resolved geometry of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub input: Shape,
    pub filter: Shape,
    pub output: Shape,
    pub scheme: PaddingScheme,
    pub pad_h: AxisPadding,
    pub pad_w: AxisPadding,
    pub stride_h: u32,
    pub stride_w: u32,
    pub activation: Activation,
    /// Output pixels per image: `out_h * out_w`.
    pub m: u32,
    /// Reduction length: `in_c * filter_h * filter_w`.
    pub k: u32,
    /// Output channels.
    pub n: u32,
}

impl ConvGeometry {
    /// Resolve output extent and padding, checking every operand shape.
    /// `output` may be unresolved; a resolved one must agree.
    pub fn resolve(
        input: Shape,
        filter: Shape,
        bias: Shape,
        output: Shape,
        params: &ConvParams,
    ) -> Result<Self> {
        if !input.is_resolved() {
            return Err(ShapeError::ZeroDimension { what: "input shape" }.into());
        }
        if !filter.is_resolved() {
            return Err(ShapeError::ZeroDimension { what: "filter shape" }.into());
        }
        if filter.channels() != input.channels() {
            return Err(ShapeError::Mismatch {
                what: "filter input channels",
                expected: input.channels(),
                actual: filter.channels(),
            }
            .into());
        }
        let n = filter.batch();
        if bias.element_count() != n as u64 {
            return Err(ShapeError::Mismatch {
                what: "bias length",
                expected: n,
                actual: bias.element_count().min(u32::MAX as u64) as u32,
            }
            .into());
        }

        let dilation = 1;
        let (out_h, pad_h, out_w, pad_w) = match params.padding {
            ConvPadding::Explicit {
                left,
                right,
                top,
                bottom,
            } => {
                let pad_h = AxisPadding::new(top, bottom);
                let pad_w = AxisPadding::new(left, right);
                (
                    padding::explicit_output_size(input.height(), filter.height(), dilation, params.stride_h, pad_h)?,
                    pad_h,
                    padding::explicit_output_size(input.width(), filter.width(), dilation, params.stride_w, pad_w)?,
                    pad_w,
                )
            }
            ConvPadding::Implicit(scheme) => (
                padding::output_size(scheme, input.height(), filter.height(), dilation, params.stride_h)?,
                padding::implicit_padding(scheme, input.height(), filter.height(), dilation, params.stride_h)?,
                padding::output_size(scheme, input.width(), filter.width(), dilation, params.stride_w)?,
                padding::implicit_padding(scheme, input.width(), filter.width(), dilation, params.stride_w)?,
            ),
        };

        let derived = Shape::new(input.batch(), out_h, out_w, n);
        if output.is_resolved() && output != derived {
            let (what, expected, actual) = first_difference(derived, output);
            return Err(ShapeError::Mismatch {
                what,
                expected,
                actual,
            }
            .into());
        }

        let m = out_h
            .checked_mul(out_w)
            .ok_or_else(|| DispatchError::Configuration(format!("output {derived} too large")))?;
        let k = input
            .channels()
            .checked_mul(filter.height())
            .and_then(|v| v.checked_mul(filter.width()))
            .ok_or_else(|| DispatchError::Configuration(format!("filter {filter} too large")))?;

        Ok(ConvGeometry {
            input,
            filter,
            output: derived,
            scheme: params.scheme(),
            pad_h,
            pad_w,
            stride_h: params.stride_h,
            stride_w: params.stride_w,
            activation: params.activation,
            m,
            k,
            n,
        })
    }

    pub fn local_size(&self) -> [u32; 3] {
        conv_local_size(self.input.channels())
    }

    pub fn payload(&self) -> SpecializationPayload {
        SpecializationPayload {
            local_size: self.local_size(),
            in_h: self.input.height(),
            in_w: self.input.width(),
            out_h: self.output.height(),
            out_w: self.output.width(),
            stride_h: self.stride_h,
            stride_w: self.stride_w,
            pad_h: self.pad_h.head,
            pad_w: self.pad_w.head,
            filter_h: self.filter.height(),
            filter_w: self.filter.width(),
            channels: self.input.channels(),
            batch: self.input.batch(),
            m: self.m,
            k: self.k,
            n: self.n,
            activation: self.activation.code(),
        }
    }
}

/// Host-side convolution with the same layouts and padding as the GPU
/// kernel.  Returns the NHWC output.
pub fn conv2d_host(geometry: &ConvGeometry, input: &[f32], filter: &[f32], bias: &[f32]) -> Vec<f32> {
    let [batch, in_h, in_w, channels] = geometry.input.dims().map(|d| d as usize);
    let [_, out_h, out_w, n] = geometry.output.dims().map(|d| d as usize);
    let (filter_h, filter_w) = (geometry.filter.height() as usize, geometry.filter.width() as usize);
    let (pad_h, pad_w) = (geometry.pad_h.head as i64, geometry.pad_w.head as i64);
    let (stride_h, stride_w) = (geometry.stride_h as usize, geometry.stride_w as usize);

    let mut out = vec![0.0f32; batch * out_h * out_w * n];
    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                for oc in 0..n {
                    let mut acc = bias[oc];
                    for ky in 0..filter_h {
                        let iy = (oy * stride_h + ky) as i64 - pad_h;
                        if iy < 0 || iy >= in_h as i64 {
                            continue;
                        }
                        for kx in 0..filter_w {
                            let ix = (ox * stride_w + kx) as i64 - pad_w;
                            if ix < 0 || ix >= in_w as i64 {
                                continue;
                            }
                            let src = ((b * in_h + iy as usize) * in_w + ix as usize) * channels;
                            let taps = ((oc * filter_h + ky) * filter_w + kx) * channels;
                            for c in 0..channels {
                                acc += input[src + c] * filter[taps + c];
                            }
                        }
                    }
                    out[((b * out_h + oy) * out_w + ox) * n + oc] = geometry.activation.apply(acc);
                }
            }
        }
    }
    out
}

fn first_difference(expected: Shape, actual: Shape) -> (&'static str, u32, u32) {
    const AXES: [&str; 4] = ["output batch", "output height", "output width", "output channels"];
    expected
        .dims()
        .into_iter()
        .zip(actual.dims())
        .zip(AXES)
        .find(|((e, a), _)| e != a)
        .map(|((e, a), what)| (what, e, a))
        .unwrap_or(("output shape", 0, 0))
}

/// Outcome of one successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvSummary {
    pub output: Shape,
    pub plan: DispatchPlan,
    pub submissions: u64,
    /// Whether this invocation compiled the pipeline.
    pub built_pipeline: bool,
}

/// One CONV_2D operator instance with its own pipeline.
pub struct ConvTranslator<D: ComputeDevice> {
    backend: DispatchBackend<D>,
    kernel: KernelBlob,
    tuning: TuningConfig,
}

impl<D: ComputeDevice> ConvTranslator<D> {
    pub fn new(device: Arc<D>, label: impl Into<String>, kernel: KernelBlob, tuning: TuningConfig) -> Self {
        ConvTranslator {
            backend: DispatchBackend::new(device, label, CONV_OPERAND_COUNT),
            kernel,
            tuning,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.backend.status()
    }

    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    /// Validate, resolve and prepare without touching the GPU.
    pub fn prepare(&self, operation: &Operation, operands: &OperandStore<D::Buffer>) -> Result<(ConvGeometry, DispatchPlan)> {
        if operation.kind != OperationType::Conv2d {
            return Err(DispatchError::UnsupportedOperation(operation.kind.to_string()));
        }
        let inputs = &operation.inputs;
        if inputs.len() != EXPLICIT_PADDING_ARITY && inputs.len() != IMPLICIT_PADDING_ARITY {
            return Err(DispatchError::Arity {
                operation: OPERATION,
                expected: "7 or 10",
                actual: inputs.len(),
            });
        }
        if operation.outputs.len() != 1 {
            return Err(DispatchError::OutputArity {
                operation: OPERATION,
                expected: 1,
                actual: operation.outputs.len(),
            });
        }

        let params = ConvParams::from_operands(inputs, operands)?;
        let tensors = [inputs[0], inputs[1], inputs[2], operation.outputs[0]];
        for id in tensors {
            operands.get(id)?.buffer()?;
        }
        let shape = |id: u32| operands.get(id).map(|o| o.shape);
        let geometry = ConvGeometry::resolve(
            shape(tensors[0])?,
            shape(tensors[1])?,
            shape(tensors[2])?,
            shape(tensors[3])?,
            &params,
        )?;

        let required = [
            ("input", tensors[0], geometry.input.element_count()),
            ("filter", tensors[1], geometry.filter.element_count()),
            ("bias", tensors[2], geometry.n as u64),
            ("output", tensors[3], geometry.output.element_count()),
        ];
        for (what, id, required) in required {
            let actual = self.backend.buffer_len(operands.get(id)?.buffer()?) as u64;
            if actual < required {
                return Err(ShapeError::BufferTooSmall {
                    what,
                    required,
                    actual,
                }
                .into());
            }
        }

        let limits = self.backend.limits();
        limits.check_local_size(geometry.local_size())?;
        let plan = DispatchPlan::new(
            geometry.n,
            geometry.m,
            geometry.input.batch(),
            geometry.local_size(),
            &self.tuning,
            &limits,
        )?;
        Ok((geometry, plan))
    }

    /// Run the convolution, blocking until every submission has completed.
    pub fn execute(&mut self, operation: &Operation, operands: &mut OperandStore<D::Buffer>) -> Result<ConvSummary> {
        let (geometry, plan) = self.prepare(operation, operands)?;
        let output_id = operation.outputs[0];

        let built_pipeline = self.backend.ensure_built(&self.kernel, || geometry.payload())?;
        if !built_pipeline && self.backend.payload() != Some(&geometry.payload()) {
            log::warn!(
                "{}: geometry changed since the pipeline was built; reusing it",
                self.backend.label()
            );
        }
        log::debug!(
            "{}: {} -> {} ({:?}, m={} k={} n={}), groups {:?}, {} partition(s) x {} batch",
            self.backend.label(),
            geometry.input,
            geometry.output,
            geometry.scheme,
            geometry.m,
            geometry.k,
            geometry.n,
            plan.natural_groups,
            plan.partition_num,
            plan.batch
        );

        let buffers = [
            operands.get(operation.inputs[0])?.buffer()?,
            operands.get(operation.inputs[1])?.buffer()?,
            operands.get(operation.inputs[2])?.buffer()?,
            operands.get(output_id)?.buffer()?,
        ];
        let bindings = self.backend.bind(&buffers)?;

        let mut submissions = 0;
        for partition in plan.partitions() {
            self.backend
                .dispatch(&bindings, &partition.push_payload(&self.tuning), partition.groups)?;
            submissions += 1;
        }

        // Only a completed operator publishes its output shape.
        if !operands.get(output_id)?.shape.is_resolved() {
            operands.set_shape(output_id, geometry.output)?;
        }

        Ok(ConvSummary {
            output: geometry.output,
            plan,
            submissions,
            built_pipeline,
        })
    }
}
