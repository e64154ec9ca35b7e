//! The native bridge: the device API surface the core relies on.
//!
//! A bridge compiles kernel source, owns device buffers, moves data and
//! launches kernels. Every call is synchronous; `launch` returns once the
//! device has finished. Two bridges ship with the crate:
//! - [`host::HostBridge`], an in-process reference executor for OpenCL C
//! - `gpu::WgpuBridge`, which runs WGSL through wgpu

pub mod host;

use std::fmt;

use crate::error::Result;

/// The kernel source dialect a bridge compiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    OpenCl,
    Wgsl,
}

impl Dialect {
    /// Name accepted by [`crate::kir::lower::create_kernel_lowering`].
    pub fn lowering_name(self) -> &'static str {
        match self {
            Dialect::OpenCl => "opencl",
            Dialect::Wgsl => "wgsl",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lowering_name())
    }
}

/// Opaque handle to a compiled entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledKernel {
    pub id: u64,
    pub entry_point: String,
}

/// Opaque handle to device-resident storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub id: u64,
    pub size_bytes: usize,
}

impl DeviceBuffer {
    /// Capacity in 32-bit elements.
    pub fn len(&self) -> usize {
        self.size_bytes / 4
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes < 4
    }
}

/// One kernel argument, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(DeviceBuffer),
    /// Work-group local memory of the given size in bytes.
    Local(usize),
    Uint(u32),
}

/// Running totals of bridge calls, used to observe cache hits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub compiles: u64,
    pub allocations: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub launches: u64,
}

impl BridgeStats {
    /// Calls that touch the device at all.
    pub fn total(&self) -> u64 {
        self.compiles + self.allocations + self.uploads + self.downloads + self.launches
    }
}

/// Device API consumed by the core.
pub trait NativeBridge {
    fn dialect(&self) -> Dialect;

    /// Compile `source` and return a handle to `entry_point`. Malformed
    /// source is `Error::CompilationError` carrying the diagnostic text.
    fn compile(&mut self, source: &str, entry_point: &str) -> Result<CompiledKernel>;

    fn allocate(&mut self, size_bytes: usize) -> Result<DeviceBuffer>;

    fn transfer_to_device(&mut self, data: &[i32], buffer: &DeviceBuffer) -> Result<()>;

    fn transfer_from_device(&mut self, buffer: &DeviceBuffer) -> Result<Vec<i32>>;

    /// Run `kernel` over `global_size` work items, blocking until done.
    /// `local_size` is the work-group size, or `None` to let the bridge
    /// choose. Device faults are `Error::ExecutionError`.
    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        args: &[KernelArg],
        global_size: usize,
        local_size: Option<usize>,
    ) -> Result<()>;

    /// Free device storage. Unknown handles are ignored.
    fn release(&mut self, buffer: DeviceBuffer);

    fn stats(&self) -> BridgeStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_buffer_len() {
        let buf = DeviceBuffer {
            id: 1,
            size_bytes: 40,
        };
        assert_eq!(buf.len(), 10);
        assert!(!buf.is_empty());
        assert!(DeviceBuffer { id: 2, size_bytes: 0 }.is_empty());
    }

    #[test]
    fn test_stats_total() {
        let stats = BridgeStats {
            compiles: 1,
            allocations: 2,
            uploads: 3,
            downloads: 4,
            launches: 5,
        };
        assert_eq!(stats.total(), 15);
        assert_eq!(BridgeStats::default().total(), 0);
    }

    #[test]
    fn test_dialect_names_resolve_to_lowerings() {
        for dialect in [Dialect::OpenCl, Dialect::Wgsl] {
            let lowering =
                crate::kir::lower::create_kernel_lowering(dialect.lowering_name()).unwrap();
            assert_eq!(lowering.target_name(), dialect.to_string());
        }
    }
}
