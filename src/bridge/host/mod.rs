//! In-process reference bridge for OpenCL C kernels.
//!
//! Device memory is a map of host vectors. Fused elementwise kernels are
//! parsed into a small program and run data-parallel with rayon; the scan
//! family is emulated phase by phase (see [`scan`]). Everything the
//! generator emits is executable here, which makes this bridge the
//! default CPU device and the oracle the GPU path is checked against.

mod interp;
mod scan;

use std::collections::HashMap;

use crate::bridge::{
    BridgeStats, CompiledKernel, DeviceBuffer, Dialect, KernelArg, NativeBridge,
};
use crate::error::{Error, Result};
use crate::kir::ScanEntry;

use interp::FusedProgram;
use scan::ScanProgram;

#[derive(Debug)]
enum Program {
    Fused(FusedProgram),
    Scan(ScanProgram),
}

#[derive(Debug, Default)]
pub struct HostBridge {
    next_id: u64,
    programs: HashMap<u64, Program>,
    memory: HashMap<u64, Vec<i32>>,
    stats: BridgeStats,
}

impl HostBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Number of live device buffers.
    pub fn live_buffers(&self) -> usize {
        self.memory.len()
    }
}

impl NativeBridge for HostBridge {
    fn dialect(&self) -> Dialect {
        Dialect::OpenCl
    }

    fn compile(&mut self, source: &str, entry_point: &str) -> Result<CompiledKernel> {
        self.stats.compiles += 1;
        let program = match ScanEntry::from_name(entry_point) {
            Some(entry) => ScanProgram::parse(source, entry).map(Program::Scan),
            None => FusedProgram::parse(source, entry_point).map(Program::Fused),
        }
        .map_err(|diagnostic| Error::compilation(entry_point, diagnostic))?;

        let id = self.fresh_id();
        self.programs.insert(id, program);
        tracing::trace!(entry_point, id, "host kernel compiled");
        Ok(CompiledKernel {
            id,
            entry_point: entry_point.to_string(),
        })
    }

    fn allocate(&mut self, size_bytes: usize) -> Result<DeviceBuffer> {
        self.stats.allocations += 1;
        let id = self.fresh_id();
        self.memory.insert(id, vec![0; size_bytes.div_ceil(4)]);
        Ok(DeviceBuffer { id, size_bytes })
    }

    fn transfer_to_device(&mut self, data: &[i32], buffer: &DeviceBuffer) -> Result<()> {
        self.stats.uploads += 1;
        let storage = self
            .memory
            .get_mut(&buffer.id)
            .ok_or_else(|| Error::execution(format!("unknown device buffer {}", buffer.id)))?;
        if data.len() > storage.len() {
            return Err(Error::execution(format!(
                "upload of {} elements into a buffer of {}",
                data.len(),
                storage.len()
            )));
        }
        storage[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn transfer_from_device(&mut self, buffer: &DeviceBuffer) -> Result<Vec<i32>> {
        self.stats.downloads += 1;
        self.memory
            .get(&buffer.id)
            .cloned()
            .ok_or_else(|| Error::execution(format!("unknown device buffer {}", buffer.id)))
    }

    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        args: &[KernelArg],
        global_size: usize,
        local_size: Option<usize>,
    ) -> Result<()> {
        self.stats.launches += 1;
        let program = self.programs.get(&kernel.id).ok_or_else(|| {
            Error::execution(format!("kernel `{}` was not compiled", kernel.entry_point))
        })?;

        match program {
            Program::Scan(scan) => scan.launch(&mut self.memory, args, global_size, local_size),
            Program::Fused(fused) => {
                let [KernelArg::Buffer(handle)] = args else {
                    return Err(Error::execution(format!(
                        "{}: expected a single buffer argument",
                        kernel.entry_point
                    )));
                };
                if let Some(local) = local_size {
                    if local == 0 || global_size % local != 0 {
                        return Err(Error::execution(format!(
                            "{}: global size {} is not a multiple of local size {}",
                            kernel.entry_point, global_size, local
                        )));
                    }
                }
                let data = self.memory.get_mut(&handle.id).ok_or_else(|| {
                    Error::execution(format!("unknown device buffer {}", handle.id))
                })?;
                if global_size > data.len() {
                    return Err(Error::execution(format!(
                        "{}: {} work items over a buffer of {} elements",
                        kernel.entry_point,
                        global_size,
                        data.len()
                    )));
                }
                // Stage a copy so a fault leaves device memory untouched.
                let mut staged = data[..global_size].to_vec();
                fused.run(&mut staged)?;
                data[..global_size].copy_from_slice(&staged);
                Ok(())
            }
        }
    }

    fn release(&mut self, buffer: DeviceBuffer) {
        if self.memory.remove(&buffer.id).is_some() {
            tracing::trace!(id = buffer.id, "host buffer released");
        }
    }

    fn stats(&self) -> BridgeStats {
        self.stats
    }
}
