//! Output extent and implicit padding for windowed operators.
//!
//! Everything here is a pure function of one spatial axis.  Rounding is
//! always towards positive infinity: an output extent that is one short
//! would leave elements that no dispatch ever writes.

use crate::error::{DispatchError, ShapeError};

/// How the padding around an operator's input is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingScheme {
    /// Pads are supplied by the caller.
    Explicit,
    /// Pad so that `out = ceil(in / stride)`.
    Same,
    /// No padding; only fully covered windows produce output.
    Valid,
}

impl PaddingScheme {
    /// Decode the implicit-padding code carried by a scalar operand
    /// (`1` = same, `2` = valid).
    pub fn from_code(code: u32) -> Result<Self, DispatchError> {
        match code {
            1 => Ok(PaddingScheme::Same),
            2 => Ok(PaddingScheme::Valid),
            other => Err(DispatchError::UnsupportedPadding(other)),
        }
    }

    /// Classify explicit pads.  Only the leading pads are consulted; the
    /// pad values themselves stay authoritative.
    pub fn classify_explicit(pad_left: u32, pad_top: u32) -> Self {
        if pad_left == 0 && pad_top == 0 {
            PaddingScheme::Valid
        } else {
            PaddingScheme::Same
        }
    }
}

/// Padding before (`head`) and after (`tail`) one spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisPadding {
    pub head: u32,
    pub tail: u32,
}

impl AxisPadding {
    pub const fn new(head: u32, tail: u32) -> Self {
        AxisPadding { head, tail }
    }

    pub fn total(&self) -> Result<u32, ShapeError> {
        self.head
            .checked_add(self.tail)
            .ok_or(ShapeError::Overflow { what: "total padding" })
    }
}

pub fn ceil_div(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor)
}

/// Span covered by a dilated filter: `(filter - 1) * dilation + 1`.
pub fn effective_filter(filter: u32, dilation: u32) -> Result<u32, ShapeError> {
    if filter == 0 {
        return Err(ShapeError::ZeroDimension { what: "filter size" });
    }
    if dilation == 0 {
        return Err(ShapeError::ZeroDilation);
    }
    (filter - 1)
        .checked_mul(dilation)
        .and_then(|span| span.checked_add(1))
        .ok_or(ShapeError::Overflow { what: "dilated filter" })
}

fn check_axis(input: u32, stride: u32) -> Result<(), ShapeError> {
    if input == 0 {
        return Err(ShapeError::ZeroDimension { what: "input size" });
    }
    if stride == 0 {
        return Err(ShapeError::ZeroStride);
    }
    Ok(())
}

/// Output extent of one axis under an implicit padding scheme.
pub fn output_size(
    scheme: PaddingScheme,
    input: u32,
    filter: u32,
    dilation: u32,
    stride: u32,
) -> Result<u32, ShapeError> {
    check_axis(input, stride)?;
    let extent = effective_filter(filter, dilation)?;
    match scheme {
        PaddingScheme::Valid => {
            if extent > input {
                return Err(ShapeError::NonPositiveOutput {
                    input,
                    filter_extent: extent,
                });
            }
            Ok(ceil_div(input - (extent - 1), stride))
        }
        PaddingScheme::Same => Ok(ceil_div(input, stride)),
        PaddingScheme::Explicit => Err(ShapeError::ExplicitNeedsPads),
    }
}

/// Pad amounts implied by a scheme.  For `Same` the head never exceeds
/// the tail.
pub fn implicit_padding(
    scheme: PaddingScheme,
    input: u32,
    filter: u32,
    dilation: u32,
    stride: u32,
) -> Result<AxisPadding, ShapeError> {
    let out = output_size(scheme, input, filter, dilation, stride)?;
    match scheme {
        PaddingScheme::Same => {
            let extent = effective_filter(filter, dilation)?;
            let needed = (out - 1)
                .checked_mul(stride)
                .and_then(|covered| covered.checked_add(extent))
                .ok_or(ShapeError::Overflow { what: "same-padded extent" })?;
            let total = needed.saturating_sub(input);
            let head = total / 2;
            Ok(AxisPadding::new(head, total - head))
        }
        _ => Ok(AxisPadding::default()),
    }
}

/// Output extent with caller-supplied pads, i.e. the valid formula applied
/// to the padded input.
pub fn explicit_output_size(
    input: u32,
    filter: u32,
    dilation: u32,
    stride: u32,
    padding: AxisPadding,
) -> Result<u32, ShapeError> {
    check_axis(input, stride)?;
    let padded = input
        .checked_add(padding.total()?)
        .ok_or(ShapeError::Overflow { what: "padded input" })?;
    let extent = effective_filter(filter, dilation)?;
    if extent > padded {
        return Err(ShapeError::NonPositiveOutput {
            input: padded,
            filter_extent: extent,
        });
    }
    Ok(ceil_div(padded - extent + 1, stride))
}
