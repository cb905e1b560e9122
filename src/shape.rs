//! Four-dimensional NHWC tensor shapes.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Named axes of a [`Shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeIdx {
    Batch = 0,
    Height = 1,
    Width = 2,
    Channel = 3,
}

/// Ordered `(batch, height, width, channel)` dimensions.
///
/// A zero dimension marks a shape that has not been resolved yet; output
/// operands are usually created that way and filled in by the translator.
/// Filters reuse the same layout as `(out_channels, height, width,
/// in_channels)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Shape([u32; 4]);

impl Shape {
    pub const fn new(batch: u32, height: u32, width: u32, channel: u32) -> Self {
        Shape([batch, height, width, channel])
    }

    /// A shape whose dimensions are all still unknown.
    pub const fn unresolved() -> Self {
        Shape([0; 4])
    }

    pub fn batch(&self) -> u32 {
        self[ShapeIdx::Batch]
    }

    pub fn height(&self) -> u32 {
        self[ShapeIdx::Height]
    }

    pub fn width(&self) -> u32 {
        self[ShapeIdx::Width]
    }

    pub fn channels(&self) -> u32 {
        self[ShapeIdx::Channel]
    }

    pub fn is_resolved(&self) -> bool {
        self.0.iter().all(|&d| d > 0)
    }

    /// Total number of elements, widened so large activations do not wrap.
    pub fn element_count(&self) -> u64 {
        self.0.iter().map(|&d| d as u64).product()
    }

    pub fn dims(&self) -> [u32; 4] {
        self.0
    }
}

impl Index<ShapeIdx> for Shape {
    type Output = u32;

    fn index(&self, idx: ShapeIdx) -> &u32 {
        &self.0[idx as usize]
    }
}

impl IndexMut<ShapeIdx> for Shape {
    fn index_mut(&mut self, idx: ShapeIdx) -> &mut u32 {
        &mut self.0[idx as usize]
    }
}

impl From<[u32; 4]> for Shape {
    fn from(dims: [u32; 4]) -> Self {
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [n, h, w, c] = self.0;
        write!(f, "({n}, {h}, {w}, {c})")
    }
}
