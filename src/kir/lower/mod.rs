//! KernelLowering: renders KIR into complete kernel source text.
//!
//! Each kernel dialect implements `KernelLowering` to emit source that a
//! native bridge compiles unmodified. Two paths exist:
//! - fused elementwise kernels built from map-task statements
//! - the fixed scan kernel family, parameterised by [`ScanConfig`]
//!
//! Source text is the only artifact; nothing here talks to a device.

mod opencl;
mod wgsl;

use crate::kir::{ElementType, FusedKernel};
use crate::tasks::{ScanConfig, Statement};

pub use opencl::OpenClLowering;
pub use wgsl::WgslLowering;

/// Lowers KIR into kernel source in one dialect.
pub trait KernelLowering {
    /// The dialect name (e.g. "opencl", "wgsl").
    fn target_name(&self) -> &str;

    /// One declaration per variable, in the order given.
    fn declarations(&self, ty: ElementType, variables: &[String]) -> String;

    /// Bind the element index and load the current element into
    /// `input_variable`.
    fn prologue(&self, ty: ElementType, input_variable: &str) -> String;

    /// Statement setting `variable` to 1 where it equals `value`, else 0.
    fn presence(&self, variable: &str, value: i32) -> Statement;

    /// A complete elementwise kernel with one entry point.
    fn lower_fused(&self, kernel: &FusedKernel) -> String;

    /// The complete scan kernel family. Dialects that fix work-group
    /// size in source bake `group_size` in; the others ignore it.
    fn lower_scan(&self, config: &ScanConfig, group_size: u32) -> String;
}

/// Create a kernel-lowering backend for the given dialect name.
pub fn create_kernel_lowering(target: &str) -> Option<Box<dyn KernelLowering>> {
    match target {
        "opencl" | "cl" => Some(Box::new(OpenClLowering::new())),
        "wgsl" | "wgpu" => Some(Box::new(WgslLowering::new())),
        _ => None,
    }
}
