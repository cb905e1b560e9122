//! Typed GPU buffers and host readback utilities.
//!
//! [`GpuBuffer`] wraps a [`wgpu::Buffer`] and tracks the number of typed
//! elements stored in it.  These are the device buffers referenced by
//! operands when the engine runs on wgpu.  All interactions with the GPU
//! go through a [`crate::GpuContext`].

use std::marker::PhantomData;
use std::sync::mpsc;

use bytemuck::{cast_slice, Pod};
use wgpu::{Buffer, BufferDescriptor, BufferUsages};

use crate::error::{DispatchError, Result};
use crate::GpuContext;

/// A typed GPU storage buffer.
///
/// The underlying buffer size in bytes is `len * size_of::<T>()`.
pub struct GpuBuffer<T: Pod> {
    pub buffer: Buffer,
    pub len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Create a storage buffer holding a copy of `data`.
    ///
    /// The buffer has usage `STORAGE | COPY_DST | COPY_SRC` plus any extra
    /// `usage` flags.
    pub fn from_slice(context: &GpuContext, data: &[T], usage: BufferUsages) -> Self {
        let bytes = cast_slice(data);
        let buffer = context.device.create_buffer(&BufferDescriptor {
            label: Some("gpu_buffer_input"),
            size: bytes.len() as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC | usage,
            mapped_at_creation: false,
        });
        // A queue write avoids requiring MAP_WRITE.  It lands before the
        // next submission on this queue.
        context.queue.write_buffer(&buffer, 0, bytes);
        Self {
            buffer,
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// Create an uninitialised output buffer of `len` elements that can
    /// be bound to a compute shader and read back with [`Self::download`].
    pub fn new_output(context: &GpuContext, len: usize, usage: BufferUsages) -> Self {
        let buffer = context.device.create_buffer(&BufferDescriptor {
            label: Some("gpu_buffer_output"),
            size: (len * std::mem::size_of::<T>()) as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | usage,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len,
            _marker: PhantomData,
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    /// Copy the buffer into a mappable staging buffer and read it back.
    ///
    /// Blocks until the GPU has finished all queued work touching the
    /// buffer.
    pub fn download(&self, context: &GpuContext) -> Result<Vec<T>> {
        let size = self.size_in_bytes();
        let staging = context.device.create_buffer(&BufferDescriptor {
            label: Some("gpu_buffer_download"),
            size,
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gpu_buffer_download_encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
        context.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DispatchError::Execution(format!("device poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| DispatchError::Execution("buffer map callback dropped".into()))?
            .map_err(|e| DispatchError::Execution(format!("buffer map failed: {e}")))?;

        let data = slice.get_mapped_range();
        let result: Vec<T> = cast_slice(&data).to_vec();
        // The mapped view must be dropped before unmapping.
        drop(data);
        staging.unmap();
        Ok(result)
    }
}
