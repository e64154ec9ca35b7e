//! Emulation of the scan kernel family.
//!
//! The scan source is recognised rather than interpreted: compilation
//! reads the `#define`s and the combining operator out of the text, and
//! each entry point is replayed work group by work group. Within a group
//! the threads run one barrier-delimited phase at a time, which is exactly
//! the ordering the barriers guarantee on a device.
//!
//! Shift counts follow OpenCL: they are taken modulo the operand width,
//! so the conflict-elimination macro behaves as its C grouping dictates.

use std::collections::HashMap;

use super::interp::kernel_body;
use crate::bridge::{DeviceBuffer, KernelArg};
use crate::error::{Error, Result};
use crate::kir::{self, ScanEntry};
use crate::parsing::BinaryOp;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ScanProgram {
    entry: ScanEntry,
    log2_banks: u32,
    eliminate_conflicts: bool,
    identity: i32,
    operator: BinaryOp,
}

impl ScanProgram {
    pub(crate) fn parse(
        source: &str,
        entry: ScanEntry,
    ) -> std::result::Result<Self, String> {
        kernel_body(source, entry.name())?;

        let log2_banks = define_value(source, "LOG2_MEMORY_BANK_COUNT")?;
        if log2_banks >= 32 {
            return Err(format!("LOG2_MEMORY_BANK_COUNT ({}) out of range", log2_banks));
        }
        let eliminate_conflicts = define_value(source, "ELIMINATE_CONFLICTS")? != 0;
        let identity = define_value(source, "SCAN_IDENTITY")? as i32;

        let marker = "shared_data[local_index_b] ";
        let operator = source
            .lines()
            .map(str::trim)
            .find_map(|line| {
                let rest = line.strip_prefix(marker)?;
                let (symbol, tail) = rest.split_once("= ")?;
                if tail != "shared_data[local_index_a];" {
                    return None;
                }
                BinaryOp::from_symbol(symbol)
            })
            .ok_or_else(|| "cannot find the scan combining operator".to_string())?;

        Ok(Self {
            entry,
            log2_banks,
            eliminate_conflicts,
            identity,
            operator,
        })
    }

    fn bank_offset(&self, index: u32) -> u32 {
        kir::bank_offset(index, self.log2_banks, self.eliminate_conflicts)
    }

    pub(crate) fn launch(
        &self,
        memory: &mut HashMap<u64, Vec<i32>>,
        args: &[KernelArg],
        global_size: usize,
        local_size: Option<usize>,
    ) -> Result<()> {
        let args = Args {
            entry: self.entry,
            args,
        };
        let local_size = local_size.unwrap_or(global_size).max(1);
        if global_size % local_size != 0 {
            return Err(Error::execution(format!(
                "{}: global size {} is not a multiple of local size {}",
                self.entry.name(),
                global_size,
                local_size
            )));
        }
        let groups = (global_size / local_size) as u32;
        let group_size = local_size as u32;

        // Decode every argument before touching device memory.
        let output = args.buffer(0)?;
        let input_handle = args.buffer(1)?;
        let plan = match self.entry {
            ScanEntry::CombineInput => Plan::Combine { n: args.uint(2)? },
            ScanEntry::UniformAdd => Plan::UniformAdd {
                shared: args.local(2)? / 4,
                group_offset: args.uint(3)?,
                base_index: args.uint(4)?,
                n: args.uint(5)?,
            },
            ScanEntry::PreScan | ScanEntry::PreScanNonPowerOfTwo => Plan::PreScan {
                shared: args.local(2)? / 4,
                sums: None,
                launch: GroupLaunch {
                    groups,
                    group_size,
                    group_index: args.uint(3)?,
                    base_index: args.uint(4)?,
                    n: args.uint(5)?,
                },
            },
            ScanEntry::PreScanStoreSum | ScanEntry::PreScanStoreSumNonPowerOfTwo => {
                Plan::PreScan {
                    shared: args.local(3)? / 4,
                    sums: Some(args.buffer(2)?),
                    launch: GroupLaunch {
                        groups,
                        group_size,
                        group_index: args.uint(4)?,
                        base_index: args.uint(5)?,
                        n: args.uint(6)?,
                    },
                }
            }
        };

        let input = read_buffer(memory, &input_handle)?;
        let mut out = take_buffer(memory, &output)?;

        let result = match plan {
            Plan::Combine { n } => self.combine_input(&mut out, &input, global_size as u32, n),
            Plan::UniformAdd {
                shared,
                group_offset,
                base_index,
                n,
            } => self.uniform_add(
                &mut out,
                &input,
                vec![0; shared],
                groups,
                group_size,
                group_offset,
                base_index,
                n,
            ),
            Plan::PreScan {
                shared,
                sums: None,
                launch,
            } => self.prescan(&mut out, &input, None, vec![0; shared], &launch),
            Plan::PreScan {
                shared,
                sums: Some(handle),
                launch,
            } => match take_buffer(memory, &handle) {
                Ok(mut sums) => {
                    let r = self.prescan(&mut out, &input, Some(&mut sums), vec![0; shared], &launch);
                    memory.insert(handle.id, sums);
                    r
                }
                Err(e) => Err(e),
            },
        };

        memory.insert(output.id, out);
        result
    }

    fn prescan(
        &self,
        out: &mut [i32],
        input: &[i32],
        mut sums: Option<&mut Vec<i32>>,
        mut shared: Vec<i32>,
        launch: &GroupLaunch,
    ) -> Result<()> {
        let gs = launch.group_size;
        let guarded = self.entry.non_power_of_two();
        let op = self.operator;

        for group_id in 0..launch.groups {
            let start = if launch.base_index == 0 {
                group_id * (gs << 1)
            } else {
                launch.base_index
            };
            let lanes: Vec<(u32, u32, u32, u32)> = (0..gs)
                .map(|local_id| {
                    let global_a = start + local_id;
                    (global_a, global_a + gs, local_id, local_id + gs)
                })
                .collect();

            // Load.
            for &(ga, gb, la, lb) in &lanes {
                let a = get(input, ga, "input_data")?;
                set(&mut shared, la + self.bank_offset(la), a, "shared_data")?;
                let b = if guarded && lb >= launch.n {
                    self.identity
                } else {
                    get(input, gb, "input_data")?
                };
                set(&mut shared, lb + self.bank_offset(lb), b, "shared_data")?;
            }

            // Up-sweep, one level per barrier.
            let mut stride = 1u32;
            let mut j = gs;
            while j > 0 {
                for local_id in 0..j {
                    let (a, b) = self.pair(stride, local_id);
                    let v = op.apply(get(&shared, b, "shared_data")?, get(&shared, a, "shared_data")?)?;
                    set(&mut shared, b, v, "shared_data")?;
                }
                stride *= 2;
                j >>= 1;
            }

            // Clear the root, optionally recording the group total.
            let root = (gs << 1) - 1;
            let root = root + self.bank_offset(root);
            if let Some(sums) = sums.as_deref_mut() {
                let slot = if launch.group_index == 0 {
                    group_id
                } else {
                    launch.group_index
                };
                let total = get(&shared, root, "shared_data")?;
                set(sums, slot, total, "partial_sums")?;
            }
            set(&mut shared, root, self.identity, "shared_data")?;

            // Down-sweep, one level per barrier.
            let mut j = 1u32;
            while j <= gs {
                stride >>= 1;
                for local_id in 0..j {
                    let (a, b) = self.pair(stride, local_id);
                    let t = get(&shared, a, "shared_data")?;
                    let vb = get(&shared, b, "shared_data")?;
                    set(&mut shared, a, vb, "shared_data")?;
                    set(&mut shared, b, op.apply(vb, t)?, "shared_data")?;
                }
                j *= 2;
            }

            // Store.
            for &(ga, gb, la, lb) in &lanes {
                let a = get(&shared, la + self.bank_offset(la), "shared_data")?;
                set(out, ga, a, "output_data")?;
                if !guarded || lb < launch.n {
                    let b = get(&shared, lb + self.bank_offset(lb), "shared_data")?;
                    set(out, gb, b, "output_data")?;
                }
            }
        }
        Ok(())
    }

    /// Bank-mapped shared indices touched by thread `local_id` at `stride`.
    fn pair(&self, stride: u32, local_id: u32) -> (u32, u32) {
        let i = 2 * stride * local_id;
        let a = i + stride - 1;
        let b = a + stride;
        (a + self.bank_offset(a), b + self.bank_offset(b))
    }

    #[allow(clippy::too_many_arguments)]
    fn uniform_add(
        &self,
        out: &mut [i32],
        input: &[i32],
        mut shared: Vec<i32>,
        groups: u32,
        gs: u32,
        group_offset: u32,
        base_index: u32,
        n: u32,
    ) -> Result<()> {
        for group_id in 0..groups {
            let value = get(input, group_id + group_offset, "input_data")?;
            set(&mut shared, 0, value, "shared_data")?;
            for local_id in 0..gs {
                let address = group_id * (gs << 1) + base_index + local_id;
                let v = self.operator.apply(get(out, address, "output_data")?, value)?;
                set(out, address, v, "output_data")?;
                if local_id + gs < n {
                    let v = self.operator.apply(get(out, address + gs, "output_data")?, value)?;
                    set(out, address + gs, v, "output_data")?;
                }
            }
        }
        Ok(())
    }

    fn combine_input(&self, out: &mut [i32], input: &[i32], global: u32, n: u32) -> Result<()> {
        for i in 0..global.min(n) {
            let v = self
                .operator
                .apply(get(out, i, "output_data")?, get(input, i, "input_data")?)?;
            set(out, i, v, "output_data")?;
        }
        Ok(())
    }
}

enum Plan {
    Combine {
        n: u32,
    },
    UniformAdd {
        shared: usize,
        group_offset: u32,
        base_index: u32,
        n: u32,
    },
    PreScan {
        shared: usize,
        sums: Option<DeviceBuffer>,
        launch: GroupLaunch,
    },
}

struct GroupLaunch {
    groups: u32,
    group_size: u32,
    group_index: u32,
    base_index: u32,
    n: u32,
}

/// Positional kernel arguments, checked against the entry's signature.
struct Args<'a> {
    entry: ScanEntry,
    args: &'a [KernelArg],
}

impl Args<'_> {
    fn mismatch(&self, index: usize, expected: &str) -> Error {
        Error::execution(format!(
            "{}: argument {} must be {}",
            self.entry.name(),
            index,
            expected
        ))
    }

    fn buffer(&self, index: usize) -> Result<DeviceBuffer> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(b)) => Ok(b.clone()),
            _ => Err(self.mismatch(index, "a buffer")),
        }
    }

    fn local(&self, index: usize) -> Result<usize> {
        match self.args.get(index) {
            Some(KernelArg::Local(bytes)) => Ok(*bytes),
            _ => Err(self.mismatch(index, "local memory")),
        }
    }

    fn uint(&self, index: usize) -> Result<u32> {
        match self.args.get(index) {
            Some(KernelArg::Uint(v)) => Ok(*v),
            _ => Err(self.mismatch(index, "a uint")),
        }
    }
}

fn define_value(source: &str, name: &str) -> std::result::Result<u32, String> {
    let prefix = format!("#define {}", name);
    let line = source
        .lines()
        .map(str::trim)
        .find(|line| {
            line.strip_prefix(&prefix)
                .is_some_and(|rest| rest.starts_with(char::is_whitespace))
        })
        .ok_or_else(|| format!("missing `#define {}`", name))?;
    let value = line[prefix.len()..]
        .trim()
        .trim_start_matches('(')
        .split(')')
        .next()
        .unwrap_or("")
        .trim();
    value
        .parse::<u32>()
        .map_err(|_| format!("`{}` is not an integer constant: `{}`", name, value))
}

fn read_buffer(memory: &HashMap<u64, Vec<i32>>, handle: &DeviceBuffer) -> Result<Vec<i32>> {
    memory
        .get(&handle.id)
        .cloned()
        .ok_or_else(|| Error::execution(format!("unknown device buffer {}", handle.id)))
}

fn take_buffer(memory: &mut HashMap<u64, Vec<i32>>, handle: &DeviceBuffer) -> Result<Vec<i32>> {
    memory
        .remove(&handle.id)
        .ok_or_else(|| Error::execution(format!("unknown device buffer {}", handle.id)))
}

fn get(data: &[i32], index: u32, name: &str) -> Result<i32> {
    data.get(index as usize).copied().ok_or_else(|| {
        Error::execution(format!(
            "out-of-bounds read of {}[{}] (length {})",
            name,
            index,
            data.len()
        ))
    })
}

fn set(data: &mut [i32], index: u32, value: i32, name: &str) -> Result<()> {
    let len = data.len();
    let slot = data.get_mut(index as usize).ok_or_else(|| {
        Error::execution(format!(
            "out-of-bounds write of {}[{}] (length {})",
            name, index, len
        ))
    })?;
    *slot = value;
    Ok(())
}
