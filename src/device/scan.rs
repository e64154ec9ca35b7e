//! Multi-level scan over device buffers.
//!
//! Each work group scans one block of `2 * group_size` elements. Inputs
//! larger than a block are scanned in three steps:
//!
//! ```text
//! blocks ─PreScanStoreSum─→ partial sums ─scan (recursive)─→ UniformAdd
//! ```
//!
//! A trailing partial block goes through the non-power-of-two variants.
//! Inputs that fit one block run a single group sized to the next power
//! of two of `ceil(n / 2)`. Inclusive scans finish with a
//! `CombineInputKernel` pass over the exclusive result.

use crate::bridge::{DeviceBuffer, KernelArg};
use crate::error::Result;
use crate::kir::{scan_local_memory_bytes, ScanEntry};
use crate::tasks::{ScanConfig, ScanStyle};

use super::Engine;

/// Scan the first `n` elements of `input` into a newly allocated buffer.
/// The input is left untouched; on failure nothing stays allocated.
pub(crate) fn scan(
    engine: &mut Engine,
    config: &ScanConfig,
    input: &DeviceBuffer,
    n: usize,
) -> Result<DeviceBuffer> {
    let output = engine
        .bridge
        .allocate(n * config.element_type.size_bytes())?;
    match scan_into(engine, config, input, &output, n) {
        Ok(()) => Ok(output),
        Err(err) => {
            engine.bridge.release(output);
            Err(err)
        }
    }
}

/// Work-group size for an input that fits a single block.
pub(crate) fn single_group_size(n: usize) -> usize {
    n.div_ceil(2).max(1).next_power_of_two()
}

fn scan_into(
    engine: &mut Engine,
    config: &ScanConfig,
    input: &DeviceBuffer,
    output: &DeviceBuffer,
    n: usize,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let exclusive = ScanConfig {
        style: ScanStyle::Exclusive,
        ..config.clone()
    };
    prescan(engine, &exclusive, input, output, n)?;

    if config.style == ScanStyle::Inclusive {
        let group_size = combine_group_size(engine, n);
        let kernel = engine.scan_kernel(config, group_size, ScanEntry::CombineInput)?;
        let args = [
            KernelArg::Buffer(output.clone()),
            KernelArg::Buffer(input.clone()),
            KernelArg::Uint(n as u32),
        ];
        let global = n.div_ceil(group_size) * group_size;
        engine
            .bridge
            .launch(&kernel, &args, global, Some(group_size))?;
    }
    Ok(())
}

fn combine_group_size(engine: &Engine, n: usize) -> usize {
    let block = engine.block_size();
    if n <= block {
        single_group_size(n)
    } else {
        engine.work_group_size()
    }
}

fn local_bytes(config: &ScanConfig, group_size: usize) -> usize {
    scan_local_memory_bytes(
        group_size as u32,
        config.log2_bank_count(),
        config.element_type,
    )
}

/// Exclusive scan of `n` elements from `input` into `output`.
fn prescan(
    engine: &mut Engine,
    config: &ScanConfig,
    input: &DeviceBuffer,
    output: &DeviceBuffer,
    n: usize,
) -> Result<()> {
    let block = engine.block_size();
    if n <= block {
        let group_size = single_group_size(n);
        let entry = if n == 2 * group_size {
            ScanEntry::PreScan
        } else {
            ScanEntry::PreScanNonPowerOfTwo
        };
        let kernel = engine.scan_kernel(config, group_size, entry)?;
        let args = [
            KernelArg::Buffer(output.clone()),
            KernelArg::Buffer(input.clone()),
            KernelArg::Local(local_bytes(config, group_size)),
            KernelArg::Uint(0),
            KernelArg::Uint(0),
            KernelArg::Uint(n as u32),
        ];
        tracing::trace!(n, group_size, entry = entry.name(), "single-block scan");
        return engine
            .bridge
            .launch(&kernel, &args, group_size, Some(group_size));
    }

    let blocks = Blocks::new(n, block);
    let sums = engine
        .bridge
        .allocate(blocks.sums_len() * config.element_type.size_bytes())?;
    let result = prescan_blocks(engine, config, input, output, &sums, &blocks);
    engine.bridge.release(sums);
    result
}

/// Split of an input into full blocks and a trailing partial block.
struct Blocks {
    block: usize,
    full: usize,
    remainder: usize,
}

impl Blocks {
    fn new(n: usize, block: usize) -> Self {
        Self {
            block,
            full: n / block,
            remainder: n % block,
        }
    }

    fn sums_len(&self) -> usize {
        self.full + usize::from(self.remainder > 0)
    }

    /// First element of the partial block.
    fn tail_base(&self) -> usize {
        self.full * self.block
    }
}

fn prescan_blocks(
    engine: &mut Engine,
    config: &ScanConfig,
    input: &DeviceBuffer,
    output: &DeviceBuffer,
    sums: &DeviceBuffer,
    blocks: &Blocks,
) -> Result<()> {
    let group_size = engine.work_group_size();
    tracing::trace!(
        full = blocks.full,
        remainder = blocks.remainder,
        group_size,
        "multi-block scan"
    );

    let kernel = engine.scan_kernel(config, group_size, ScanEntry::PreScanStoreSum)?;
    let args = [
        KernelArg::Buffer(output.clone()),
        KernelArg::Buffer(input.clone()),
        KernelArg::Buffer(sums.clone()),
        KernelArg::Local(local_bytes(config, group_size)),
        KernelArg::Uint(0),
        KernelArg::Uint(0),
        KernelArg::Uint(blocks.block as u32),
    ];
    engine
        .bridge
        .launch(&kernel, &args, blocks.full * group_size, Some(group_size))?;

    if blocks.remainder > 0 {
        let tail_size = single_group_size(blocks.remainder);
        let kernel = engine.scan_kernel(
            config,
            tail_size,
            ScanEntry::PreScanStoreSumNonPowerOfTwo,
        )?;
        let args = [
            KernelArg::Buffer(output.clone()),
            KernelArg::Buffer(input.clone()),
            KernelArg::Buffer(sums.clone()),
            KernelArg::Local(local_bytes(config, tail_size)),
            KernelArg::Uint(blocks.full as u32),
            KernelArg::Uint(blocks.tail_base() as u32),
            KernelArg::Uint(blocks.remainder as u32),
        ];
        engine
            .bridge
            .launch(&kernel, &args, tail_size, Some(tail_size))?;
    }

    let scanned = scan(engine, config, sums, blocks.sums_len())?;
    let result = uniform_add(engine, config, output, &scanned, blocks);
    engine.bridge.release(scanned);
    result
}

/// Fold each block's scanned prefix back into its elements.
fn uniform_add(
    engine: &mut Engine,
    config: &ScanConfig,
    output: &DeviceBuffer,
    scanned: &DeviceBuffer,
    blocks: &Blocks,
) -> Result<()> {
    let element = config.element_type.size_bytes();
    let group_size = engine.work_group_size();
    let kernel = engine.scan_kernel(config, group_size, ScanEntry::UniformAdd)?;
    let args = [
        KernelArg::Buffer(output.clone()),
        KernelArg::Buffer(scanned.clone()),
        KernelArg::Local(element),
        KernelArg::Uint(0),
        KernelArg::Uint(0),
        KernelArg::Uint(blocks.block as u32),
    ];
    engine
        .bridge
        .launch(&kernel, &args, blocks.full * group_size, Some(group_size))?;

    if blocks.remainder > 0 {
        // Two elements per thread, so every thread's first write is in range.
        let tail_size = blocks.remainder.div_ceil(2);
        let kernel = engine.scan_kernel(config, tail_size, ScanEntry::UniformAdd)?;
        let args = [
            KernelArg::Buffer(output.clone()),
            KernelArg::Buffer(scanned.clone()),
            KernelArg::Local(element),
            KernelArg::Uint(blocks.full as u32),
            KernelArg::Uint(blocks.tail_base() as u32),
            KernelArg::Uint(blocks.remainder as u32),
        ];
        engine
            .bridge
            .launch(&kernel, &args, tail_size, Some(tail_size))?;
    }
    Ok(())
}
