//! GPU compute infrastructure.
//!
//! Uses wgpu for cross-platform GPU execution (Metal, Vulkan, DX12).
//! Provides device initialization and the WGSL bridge.

mod bridge;

pub use bridge::WgpuBridge;

/// Try to create a wgpu device and queue.
/// Returns None if no GPU adapter is available.
pub fn try_create_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("hadope-gpu"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    ))
    .ok()?;
    tracing::info!(
        adapter = %adapter.get_info().name,
        backend = ?adapter.get_info().backend,
        "gpu device ready"
    );
    Some((device, queue))
}
