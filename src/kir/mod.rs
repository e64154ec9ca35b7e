//! KIR: kernel IR for the data-parallel device targets.
//!
//! KIR is deliberately thin. Map tasks are already scalar statements over
//! one element; KIR gathers the drained tasks into a [`FusedKernel`] and
//! hands it to a dialect lowering. Scan tasks never become statements:
//! they select the fixed scan kernel family, whose entry points are
//! listed by [`ScanEntry`].
//!
//! Pipeline:
//! ```text
//! closure → Expression → Statement → Task ─┬→ FusedKernel → lower_fused → source
//!                                          └→ ScanConfig  → lower_scan  → source
//! ```
//!
//! Each device thread handles one element:
//! - prologue → load `data_array[global_id]` into the parameter variable
//! - statements → scalar computation per thread
//! - epilogue → store the parameter variable back in place
//!
//! Supported dialects:
//! - OpenCL C, executed by the host reference bridge
//! - WGSL, executed by wgpu on real GPUs

pub mod lower;

use std::fmt;

use crate::error::{Error, Result};
use crate::tasks::{KernelFragment, Statement, Task};

/// Threads per work group for fused elementwise kernels in dialects that
/// fix the group size in source.
pub const FUSED_WORKGROUP_SIZE: u32 = 64;

/// Element type of device buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ElementType {
    #[default]
    Int,
}

impl ElementType {
    pub fn c_name(self) -> &'static str {
        match self {
            ElementType::Int => "int",
        }
    }

    pub fn wgsl_name(self) -> &'static str {
        match self {
            ElementType::Int => "i32",
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::Int => 4,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.c_name())
    }
}

/// One elementwise kernel fused from consecutive map tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FusedKernel {
    pub entry_point: String,
    pub element_type: ElementType,
    pub input_variable: String,
    /// Union of the tasks' required variables, first introduction first.
    pub variables: Vec<String>,
    /// All statements in FIFO task order.
    pub statements: Vec<Statement>,
}

impl FusedKernel {
    /// Fuse map tasks by concatenation. The entry point is named after a
    /// hash of the fused body, so identical fusions compile to one kernel.
    pub fn from_tasks(tasks: &[Task], element_type: ElementType) -> Result<Self> {
        let first = tasks.first().ok_or_else(|| {
            Error::InvalidConstruction("cannot fuse an empty task list".to_string())
        })?;

        let mut variables: Vec<String> = Vec::new();
        let mut statements = Vec::new();

        for task in tasks {
            match task.kernel_fragment() {
                KernelFragment::Statements {
                    variables: vars,
                    statements: stmts,
                } => {
                    for var in vars {
                        if !variables.contains(var) {
                            variables.push(var.clone());
                        }
                    }
                    statements.extend(stmts.iter().cloned());
                }
                KernelFragment::Scan(_) => {
                    return Err(Error::InvalidConstruction(format!(
                        "scan task `{}` cannot be fused into an elementwise kernel",
                        task.name()
                    )));
                }
            }
        }

        let input_variable = first.input_variable().to_string();
        Ok(Self {
            entry_point: body_entry_point(element_type, &input_variable, &variables, &statements),
            element_type,
            input_variable,
            variables,
            statements,
        })
    }
}

fn body_entry_point(
    element_type: ElementType,
    input_variable: &str,
    variables: &[String],
    statements: &[Statement],
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(element_type.c_name().as_bytes());
    hasher.update(&[0]);
    hasher.update(input_variable.as_bytes());
    hasher.update(&[0]);
    for var in variables {
        hasher.update(var.as_bytes());
        hasher.update(&[0]);
    }
    hasher.update(&[1]);
    for stmt in statements {
        hasher.update(stmt.to_string().as_bytes());
        hasher.update(&[0]);
    }
    let hex = hasher.finalize().to_hex();
    format!("fused_{}", &hex.as_str()[..16])
}

/// Entry points of the scan kernel family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanEntry {
    PreScan,
    PreScanStoreSum,
    PreScanStoreSumNonPowerOfTwo,
    PreScanNonPowerOfTwo,
    UniformAdd,
    /// Inclusive scans only: `output[i] = output[i] op input[i]`.
    CombineInput,
}

impl ScanEntry {
    pub const ALL: [ScanEntry; 6] = [
        ScanEntry::PreScan,
        ScanEntry::PreScanStoreSum,
        ScanEntry::PreScanStoreSumNonPowerOfTwo,
        ScanEntry::PreScanNonPowerOfTwo,
        ScanEntry::UniformAdd,
        ScanEntry::CombineInput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScanEntry::PreScan => "PreScanKernel",
            ScanEntry::PreScanStoreSum => "PreScanStoreSumKernel",
            ScanEntry::PreScanStoreSumNonPowerOfTwo => "PreScanStoreSumNonPowerOfTwoKernel",
            ScanEntry::PreScanNonPowerOfTwo => "PreScanNonPowerOfTwoKernel",
            ScanEntry::UniformAdd => "UniformAddKernel",
            ScanEntry::CombineInput => "CombineInputKernel",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }

    /// Whether the entry writes one total per group to `partial_sums`.
    pub fn stores_sum(self) -> bool {
        matches!(
            self,
            ScanEntry::PreScanStoreSum | ScanEntry::PreScanStoreSumNonPowerOfTwo
        )
    }

    /// Whether loads and stores past `n` are guarded.
    pub fn non_power_of_two(self) -> bool {
        matches!(
            self,
            ScanEntry::PreScanNonPowerOfTwo | ScanEntry::PreScanStoreSumNonPowerOfTwo
        )
    }
}

/// Bytes of work-group local memory a scan group of `group_size` threads
/// needs, including room for bank-offset padding.
pub fn scan_local_memory_bytes(group_size: u32, log2_banks: u32, ty: ElementType) -> usize {
    shared_elements(group_size, log2_banks) * ty.size_bytes()
}

pub(crate) fn shared_elements(group_size: u32, log2_banks: u32) -> usize {
    let block = 2 * group_size as usize;
    block + (block >> log2_banks) + (block >> (2 * log2_banks)) + 1
}

/// Value of `MEMORY_BANK_OFFSET(index)`. With elimination on, the macro
/// `index >> LOG2 + index >> (2*LOG2)` groups as
/// `(index >> (LOG2 + index)) >> (2*LOG2)`; shift counts wrap at 32.
pub fn bank_offset(index: u32, log2_banks: u32, eliminate: bool) -> u32 {
    if eliminate {
        index
            .wrapping_shr(log2_banks.wrapping_add(index))
            .wrapping_shr(2 * log2_banks)
    } else {
        index >> log2_banks
    }
}

/// Check that the bank-offset mapping gives each local index of a
/// `group_size`-thread scan group its own slot in shared memory.
///
/// Without elimination the mapping is strictly increasing. With it, few
/// banks fold distinct indices onto one slot (2 banks: 31 and 38 both land
/// on 38), which would corrupt the scan.
pub fn check_local_layout(group_size: u32, log2_banks: u32, eliminate: bool) -> Result<()> {
    let slots = shared_elements(group_size, log2_banks);
    let mut owner: Vec<Option<u32>> = vec![None; slots];
    for index in 0..2 * group_size {
        let slot = (index + bank_offset(index, log2_banks, eliminate)) as usize;
        match owner.get_mut(slot) {
            None => {
                return Err(Error::Config(format!(
                    "local index {} maps past the {} shared-memory slots",
                    index, slots
                )))
            }
            Some(Some(other)) => {
                return Err(Error::Config(format!(
                    "bank conflict elimination with {} banks maps local indices {} and {} \
                     to slot {} (work group size {})",
                    1u32 << log2_banks,
                    other,
                    index,
                    slot,
                    group_size
                )))
            }
            Some(free) => *free = Some(index),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::BinaryOp;
    use crate::tasks::{ScanConfig, ScanStyle};

    #[test]
    fn test_fuse_concatenates_in_fifo_order() {
        let mut a = Task::map();
        a.add_statement(Statement::new("x", "(x) + (1)"));
        let mut b = Task::map();
        b.add_variables(["t"])
            .add_statement(Statement::new("x", "(x) * (2)"));

        let kernel = FusedKernel::from_tasks(&[a, b], ElementType::Int).unwrap();
        assert!(kernel.entry_point.starts_with("fused_"));
        assert_eq!(kernel.variables, vec!["x".to_string(), "t".to_string()]);
        let rendered: Vec<String> = kernel.statements.iter().map(|s| s.to_string()).collect();
        assert_eq!(rendered, vec!["x = (x) + (1)", "x = (x) * (2)"]);
    }

    #[test]
    fn test_entry_point_follows_body() {
        let task = |stmt: &str| {
            let mut t = Task::map();
            t.add_statement(Statement::new("x", stmt));
            t
        };
        let first = FusedKernel::from_tasks(&[task("(x) + (1)")], ElementType::Int).unwrap();
        let again = FusedKernel::from_tasks(&[task("(x) + (1)")], ElementType::Int).unwrap();
        let other = FusedKernel::from_tasks(&[task("(x) + (2)")], ElementType::Int).unwrap();
        let split = FusedKernel::from_tasks(
            &[task("(x) + (1)"), task("(x) + (1)")],
            ElementType::Int,
        )
        .unwrap();

        assert_eq!(first.entry_point, again.entry_point);
        assert_ne!(first.entry_point, other.entry_point);
        assert_ne!(first.entry_point, split.entry_point);
        assert_eq!(first.entry_point.len(), "fused_".len() + 16);
    }

    #[test]
    fn test_fuse_rejects_scan_and_empty() {
        let scan = Task::scan(ScanConfig::new(ScanStyle::Exclusive, BinaryOp::Add));
        assert!(FusedKernel::from_tasks(&[scan], ElementType::Int).is_err());
        assert!(FusedKernel::from_tasks(&[], ElementType::Int).is_err());
    }

    #[test]
    fn test_scan_entry_names() {
        for entry in ScanEntry::ALL {
            assert_eq!(ScanEntry::from_name(entry.name()), Some(entry));
        }
        assert_eq!(ScanEntry::from_name("map1"), None);
        assert!(ScanEntry::PreScanStoreSumNonPowerOfTwo.stores_sum());
        assert!(ScanEntry::PreScanStoreSumNonPowerOfTwo.non_power_of_two());
        assert!(!ScanEntry::UniformAdd.stores_sum());
    }

    #[test]
    fn test_local_memory_covers_padding() {
        // 256 elements, 32 banks: 256 + 8 + 0 + 1
        assert_eq!(shared_elements(128, 5), 265);
        assert_eq!(scan_local_memory_bytes(128, 5, ElementType::Int), 265 * 4);
    }

    #[test]
    fn test_layout_without_elimination_always_fits() {
        for log2 in 0..=6 {
            let mut wg = 1;
            while wg <= 256 {
                assert!(check_local_layout(wg, log2, false).is_ok(), "wg={wg} log2={log2}");
                wg *= 2;
            }
        }
    }

    #[test]
    fn test_layout_with_elimination_rejects_folded_slots() {
        // 2 banks: 31 lands on 38 once the block reaches 38 elements.
        assert_eq!(bank_offset(31, 1, true), 7);
        assert!(check_local_layout(16, 1, true).is_ok());
        assert!(matches!(check_local_layout(32, 1, true), Err(Error::Config(_))));
        // 1 bank: 33 and 49 collide.
        assert!(check_local_layout(16, 0, true).is_ok());
        assert!(check_local_layout(128, 0, true).is_err());
        // 16 banks: 284 and 285 collide in a 512-element block.
        assert!(check_local_layout(128, 4, true).is_ok());
        assert!(check_local_layout(256, 4, true).is_err());
        // 32 banks: no index below 1024 gets an offset.
        assert!(check_local_layout(256, 5, true).is_ok());
    }
}
