//! Operands and operator descriptors handed over by the model loader.
//!
//! The store is generic over the buffer type so that the same translator
//! code drives a real wgpu device and the recording device used in tests.

use std::fmt;

use crate::error::{DispatchError, Result};
use crate::shape::Shape;

/// Small constant carried inline instead of in a device buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int32(i32),
    UInt32(u32),
    Float32(f32),
}

/// Payload of an operand.
#[derive(Debug, Clone)]
pub enum OperandValue<B> {
    Buffer(B),
    Scalar(ScalarValue),
}

#[derive(Debug, Clone)]
pub struct Operand<B> {
    pub id: u32,
    pub shape: Shape,
    pub value: OperandValue<B>,
}

impl<B> Operand<B> {
    pub fn buffer(&self) -> Result<&B> {
        match &self.value {
            OperandValue::Buffer(buffer) => Ok(buffer),
            OperandValue::Scalar(_) => Err(DispatchError::invalid_operand(
                self.id,
                "expected a device buffer, found a scalar",
            )),
        }
    }

    /// Read an inlined scalar as an unsigned integer.  Negative integers and
    /// non-integral floats are rejected rather than wrapped.
    pub fn scalar_u32(&self) -> Result<u32> {
        match &self.value {
            OperandValue::Scalar(ScalarValue::UInt32(v)) => Ok(*v),
            OperandValue::Scalar(ScalarValue::Int32(v)) => u32::try_from(*v)
                .map_err(|_| DispatchError::invalid_operand(self.id, format!("negative scalar {v}"))),
            OperandValue::Scalar(ScalarValue::Float32(v)) => Err(DispatchError::invalid_operand(
                self.id,
                format!("expected an integer scalar, found {v}"),
            )),
            OperandValue::Buffer(_) => Err(DispatchError::invalid_operand(
                self.id,
                "expected an inlined scalar, found a device buffer",
            )),
        }
    }
}

/// Operands of one model, indexed by their identifier.
#[derive(Debug)]
pub struct OperandStore<B> {
    operands: Vec<Operand<B>>,
}

impl<B> Default for OperandStore<B> {
    fn default() -> Self {
        OperandStore {
            operands: Vec::new(),
        }
    }
}

impl<B> OperandStore<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer-backed operand and return its identifier.
    pub fn add_buffer(&mut self, shape: Shape, buffer: B) -> u32 {
        self.push(shape, OperandValue::Buffer(buffer))
    }

    /// Append a 0-D scalar operand and return its identifier.
    pub fn add_scalar(&mut self, value: ScalarValue) -> u32 {
        self.push(Shape::default(), OperandValue::Scalar(value))
    }

    fn push(&mut self, shape: Shape, value: OperandValue<B>) -> u32 {
        let id = self.operands.len() as u32;
        self.operands.push(Operand { id, shape, value });
        id
    }

    pub fn get(&self, id: u32) -> Result<&Operand<B>> {
        self.operands
            .get(id as usize)
            .ok_or(DispatchError::MissingOperand(id))
    }

    /// Record the resolved shape of an output operand.
    pub fn set_shape(&mut self, id: u32, shape: Shape) -> Result<()> {
        let operand = self
            .operands
            .get_mut(id as usize)
            .ok_or(DispatchError::MissingOperand(id))?;
        operand.shape = shape;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.operands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }
}

/// Operator kinds the executor knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Conv2d,
    /// Any kind without a GPU translator, kept by its raw tag.
    Other(u32),
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Conv2d => write!(f, "CONV_2D"),
            OperationType::Other(tag) => write!(f, "operation #{tag}"),
        }
    }
}

/// An operator as described by the model: its kind and operand lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationType,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
}

impl Operation {
    pub fn new(kind: OperationType, inputs: Vec<u32>, outputs: Vec<u32>) -> Self {
        Operation {
            kind,
            inputs,
            outputs,
        }
    }
}
