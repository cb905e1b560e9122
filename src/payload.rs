//! Constant blocks handed to the convolution kernel.
//!
//! [`SpecializationPayload`] is baked into the pipeline when it is built.
//! Its serialised layout is a binary contract with the compiled kernel:
//! nineteen 32-bit little-endian integers, constant id `i` at byte offset
//! `4 * i`, in the order of [`SpecializationPayload::FIELD_NAMES`].  Any
//! change to the order is a new kernel version.
//!
//! [`PushPayload`] is the small block rewritten before every submission.

use bytemuck::{Pod, Zeroable};

/// Local workgroup size of the convolution kernel family.
///
/// Fixed by the kernel's internal tiling rather than derived at runtime.
pub fn conv_local_size(channels: u32) -> [u32; 3] {
    if channels == 1 {
        [1, 16, 1]
    } else {
        [1, 16, 4]
    }
}

/// One specialization constant: its id and where it lives in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub constant_id: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecializationPayload {
    pub local_size: [u32; 3],
    pub in_h: u32,
    pub in_w: u32,
    pub out_h: u32,
    pub out_w: u32,
    pub stride_h: u32,
    pub stride_w: u32,
    pub pad_h: u32,
    pub pad_w: u32,
    pub filter_h: u32,
    pub filter_w: u32,
    pub channels: u32,
    pub batch: u32,
    pub m: u32,
    pub k: u32,
    pub n: u32,
    pub activation: u32,
}

impl SpecializationPayload {
    pub const FIELD_COUNT: usize = 19;
    pub const FIELD_SIZE: usize = 4;
    pub const BYTE_LEN: usize = Self::FIELD_COUNT * Self::FIELD_SIZE;

    pub const FIELD_NAMES: [&'static str; Self::FIELD_COUNT] = [
        "local_sz_x",
        "local_sz_y",
        "local_sz_z",
        "in_h",
        "in_w",
        "out_h",
        "out_w",
        "stride_h",
        "stride_w",
        "pad_h",
        "pad_w",
        "filter_h",
        "filter_w",
        "channels",
        "batch",
        "m",
        "k",
        "n",
        "activation",
    ];

    /// Field values in constant-id order.
    pub fn fields(&self) -> [u32; Self::FIELD_COUNT] {
        let [lx, ly, lz] = self.local_size;
        [
            lx,
            ly,
            lz,
            self.in_h,
            self.in_w,
            self.out_h,
            self.out_w,
            self.stride_h,
            self.stride_w,
            self.pad_h,
            self.pad_w,
            self.filter_h,
            self.filter_w,
            self.channels,
            self.batch,
            self.m,
            self.k,
            self.n,
            self.activation,
        ]
    }

    /// Serialise field by field, independent of the struct's memory layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::BYTE_LEN);
        for value in self.fields() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    pub fn map_entries() -> [MapEntry; Self::FIELD_COUNT] {
        std::array::from_fn(|i| MapEntry {
            constant_id: i as u32,
            offset: (i * Self::FIELD_SIZE) as u32,
            size: Self::FIELD_SIZE as u32,
        })
    }

    /// Pipeline-overridable constants keyed by numeric id, as wgpu expects
    /// them for `@id(n)` overrides and SPIR-V `SpecId` decorations.  Values
    /// are decoded from the serialised block through [`Self::map_entries`],
    /// so the pipeline sees exactly what a raw specialization block holds.
    pub fn overrides(&self) -> Vec<(String, f64)> {
        let block = self.to_bytes();
        Self::map_entries()
            .iter()
            .map(|entry| {
                let at = entry.offset as usize;
                let mut word = [0u8; Self::FIELD_SIZE];
                word.copy_from_slice(&block[at..at + Self::FIELD_SIZE]);
                (entry.constant_id.to_string(), u32::from_le_bytes(word) as f64)
            })
            .collect()
    }
}

/// Per-submission slice selector, bound as a uniform block.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PushPayload {
    pub batch_index: u32,
    pub batch_end: u32,
    pub channel_begin: u32,
    pub channel_end: u32,
    pub row_begin: u32,
    pub row_end: u32,
    pub block_width: u32,
    pub block_height: u32,
}

impl PushPayload {
    pub const SIZE: u64 = std::mem::size_of::<PushPayload>() as u64;
}
