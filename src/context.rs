//! GPU context initialization.
//!
//! This module provides a thin wrapper around wgpu's instance, adapter,
//! device and queue objects.  The `new_blocking` constructor hides the
//! asynchronous nature of requesting an adapter and device by using the
//! [`pollster`] crate.

use wgpu::{Adapter, Device, Instance, Queue};

use crate::error::{DispatchError, Result};

/// A GPU context encapsulates all state needed to submit compute work.
///
/// Operator translators share one context through an `Arc`; each
/// translator still owns its own pipeline and binding layout.
pub struct GpuContext {
    pub instance: Instance,
    /// The physical device selected for computation.  Its limits decide
    /// how large a single dispatch may be.
    pub adapter: Adapter,
    /// Logical device used to create resources and command encoders.
    pub device: Device,
    /// Command submission queue used to send recorded command buffers
    /// to the GPU.
    pub queue: Queue,
}

impl GpuContext {
    /// Create a new GPU context synchronously.
    ///
    /// Blocks the current thread while the adapter and device requests
    /// complete.  See [`Self::new_async`] for the asynchronous variant.
    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    /// Create a new GPU context asynchronously.
    pub async fn new_async() -> Result<Self> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .map_err(|e| DispatchError::Device(format!("unable to find a suitable GPU adapter: {e}")))?;
        // Downlevel devices may not support compute on all backends;
        // abort early if unsupported.
        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(DispatchError::Device(
                "selected adapter does not support compute shaders".into(),
            ));
        }
        // Downlevel limits match the reference profile: 65535 groups per
        // axis and four storage buffers per stage, enough for
        // input/filter/bias/output.
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpgpu_dispatch_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| DispatchError::Device(format!("failed to create GPU device: {e}")))?;

        let info = adapter.get_info();
        log::info!("using {} ({:?})", info.name, info.backend);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }
}
