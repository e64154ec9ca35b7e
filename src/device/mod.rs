//! Devices: the buffer manager that drives the whole pipeline.
//!
//! A [`Device`] owns one active [`Buffer`] and a native bridge. Mapping
//! and scanning only queue tasks; reading the buffer (or reducing it)
//! materializes:
//!
//! 1. sync the host copy if the device holds unread results
//! 2. upload if the device copy is stale
//! 3. run the drained queue as stages: consecutive maps fuse into one
//!    kernel, each scan runs the multi-level scan pipeline
//! 4. download and mark both copies current
//!
//! A read with nothing queued and the host copy current is a cache hit
//! and makes no bridge call at all.
//!
//! Devices are obtained from a [`DeviceRegistry`], which creates one
//! device per [`DeviceKind`] on first request and hands out the same
//! instance afterwards.

pub mod buffer;
pub mod cast;
mod scan;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::bridge::host::HostBridge;
use crate::bridge::{BridgeStats, CompiledKernel, DeviceBuffer, Dialect, KernelArg, NativeBridge};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gpu::WgpuBridge;
use crate::kir::lower::{KernelLowering, OpenClLowering, WgslLowering};
use crate::kir::{ElementType, FusedKernel, ScanEntry};
use crate::parsing::{translate, BinaryOp, ClosureTrace, Expression, Traced, PARAMETER};
use crate::registry::{DataSetRegistry, OperationRegistry};
use crate::tasks::{ScanConfig, ScanStyle, Statement, Task, TaskKind};

pub use buffer::{Buffer, BufferState};
pub use cast::HostElement;

use buffer::Reduction;

// ─── Device kinds ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpu" => Some(DeviceKind::Cpu),
            "gpu" => Some(DeviceKind::Gpu),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Engine ────────────────────────────────────────────────────────

/// Bridge, lowering and compiled-kernel cache of one device.
pub(crate) struct Engine {
    pub(crate) bridge: Box<dyn NativeBridge>,
    lowering: Box<dyn KernelLowering>,
    config: Config,
    kernels: HashMap<blake3::Hash, CompiledKernel>,
}

impl Engine {
    pub(crate) fn new(bridge: Box<dyn NativeBridge>, config: Config) -> Self {
        let lowering: Box<dyn KernelLowering> = match bridge.dialect() {
            Dialect::OpenCl => Box::new(OpenClLowering::new()),
            Dialect::Wgsl => Box::new(WgslLowering::new()),
        };
        Self {
            bridge,
            lowering,
            config,
            kernels: HashMap::new(),
        }
    }

    pub(crate) fn work_group_size(&self) -> usize {
        self.config.scan.work_group_size as usize
    }

    /// Elements scanned by one work group.
    pub(crate) fn block_size(&self) -> usize {
        2 * self.work_group_size()
    }

    /// Compile through the cache, keyed by source and entry point.
    fn kernel(&mut self, source: &str, entry_point: &str) -> Result<CompiledKernel> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source.as_bytes());
        hasher.update(&[0]);
        hasher.update(entry_point.as_bytes());
        let key = hasher.finalize();

        if let Some(kernel) = self.kernels.get(&key) {
            tracing::trace!(entry_point, "kernel cache hit");
            return Ok(kernel.clone());
        }
        let kernel = self.bridge.compile(source, entry_point)?;
        tracing::debug!(entry_point, dialect = %self.bridge.dialect(), "kernel compiled");
        self.kernels.insert(key, kernel.clone());
        Ok(kernel)
    }

    pub(crate) fn scan_kernel(
        &mut self,
        config: &ScanConfig,
        group_size: usize,
        entry: ScanEntry,
    ) -> Result<CompiledKernel> {
        let source = self.lowering.lower_scan(config, group_size as u32);
        self.kernel(&source, entry.name())
    }

    /// Fuse map tasks into one kernel and run it in place over `n`
    /// elements of `data`.
    fn run_fused(
        &mut self,
        tasks: &[Task],
        ty: ElementType,
        data: &DeviceBuffer,
        n: usize,
    ) -> Result<()> {
        let fused = FusedKernel::from_tasks(tasks, ty)?;
        let source = self.lowering.lower_fused(&fused);
        let kernel = self.kernel(&source, &fused.entry_point)?;
        tracing::debug!(
            entry_point = %fused.entry_point,
            tasks = tasks.len(),
            n,
            "dispatching fused kernel"
        );
        self.bridge
            .launch(&kernel, &[KernelArg::Buffer(data.clone())], n, None)
    }

    /// Reduce `host` on the device: an inclusive scan whose last element
    /// is the total. Counting first maps each element to its presence.
    fn reduce(&mut self, host: &[i32], ty: ElementType, key: Reduction) -> Result<i32> {
        let operator = match key {
            Reduction::Fold(op) => op,
            Reduction::Count(_) => BinaryOp::Add,
        };
        ScanConfig::from_config(ScanStyle::Inclusive, operator, &self.config)
            .check_local_layout(self.config.scan.work_group_size)?;

        let scratch = self.bridge.allocate(host.len() * ty.size_bytes())?;
        let result = self.reduce_into(&scratch, host, ty, key);
        self.bridge.release(scratch);
        result
    }

    fn reduce_into(
        &mut self,
        scratch: &DeviceBuffer,
        host: &[i32],
        ty: ElementType,
        key: Reduction,
    ) -> Result<i32> {
        let n = host.len();
        self.bridge.transfer_to_device(host, scratch)?;
        let operator = match key {
            Reduction::Fold(op) => op,
            Reduction::Count(value) => {
                let mut presence = Task::map();
                presence.add_statement(self.lowering.presence(PARAMETER, value));
                self.run_fused(&[presence], ty, scratch, n)?;
                BinaryOp::Add
            }
        };

        let config = ScanConfig::from_config(ScanStyle::Inclusive, operator, &self.config);
        let scanned = scan::scan(self, &config, scratch, n)?;
        let values = self.bridge.transfer_from_device(&scanned);
        self.bridge.release(scanned);
        values?
            .get(n - 1)
            .copied()
            .ok_or_else(|| Error::execution("scan result shorter than its input"))
    }
}

/// One step of a drained queue.
enum Stage<'a> {
    Fused(&'a [Task]),
    Scan(&'a ScanConfig),
}

fn stages(tasks: &[Task]) -> Vec<Stage<'_>> {
    tasks
        .chunk_by(|a, b| a.is_map() && b.is_map())
        .map(|run| match run[0].kind() {
            TaskKind::Scan(config) => Stage::Scan(config),
            TaskKind::Map | TaskKind::Abstract => Stage::Fused(run),
        })
        .collect()
}

// ─── Device ────────────────────────────────────────────────────────

pub struct Device {
    kind: DeviceKind,
    engine: Engine,
    buffer: Option<Buffer>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("dialect", &self.engine.bridge.dialect())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Device {
    pub fn new(kind: DeviceKind, bridge: Box<dyn NativeBridge>, config: Config) -> Self {
        Self {
            kind,
            engine: Engine::new(bridge, config),
            buffer: None,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn dialect(&self) -> Dialect {
        self.engine.bridge.dialect()
    }

    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    /// Bridge call totals since the device was created.
    pub fn stats(&self) -> BridgeStats {
        self.engine.bridge.stats()
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn state(&self) -> BufferState {
        self.buffer
            .as_ref()
            .map_or(BufferState::Empty, Buffer::state)
    }

    /// Replace the active buffer with `data`. No transfer happens here.
    pub fn load(&mut self, data: impl Into<Vec<i32>>) -> &mut Self {
        let data = data.into();
        if let Some(old) = self.buffer.take() {
            if let Some(handle) = old.device {
                self.engine.bridge.release(handle);
            }
        }
        tracing::debug!(device = %self.kind, len = data.len(), "dataset loaded");
        self.buffer = Some(Buffer::new(data, ElementType::Int));
        self
    }

    pub fn load_dataset(&mut self, datasets: &DataSetRegistry, name: &str) -> Result<&mut Self> {
        let data = datasets.get(name)?.to_vec();
        Ok(self.load(data))
    }

    /// Translate a closure trace and queue it as a map.
    pub fn map(&mut self, trace: &ClosureTrace) -> Result<&mut Self> {
        let expr = translate(trace)?;
        self.map_expression(&expr)
    }

    /// Record a Rust closure and queue it as a map.
    pub fn map_fn<F>(&mut self, f: F) -> Result<&mut Self>
    where
        F: FnOnce(Traced) -> Traced,
    {
        self.map(&ClosureTrace::record(f))
    }

    pub fn map_named(&mut self, operations: &OperationRegistry, name: &str) -> Result<&mut Self> {
        let expr = operations.get(name)?.clone();
        self.map_expression(&expr)
    }

    pub fn map_expression(&mut self, expr: &Expression) -> Result<&mut Self> {
        let buffer = self.buffer.as_mut().ok_or(Error::NoDataLoaded)?;
        let mut task = Task::map();
        task.add_statement(Statement::assign(expr));
        buffer.enqueue(task);
        Ok(self)
    }

    /// Queue an in-place scan of the buffer. Only associative operators
    /// scan in parallel; `-` and `/` are rejected before anything queues.
    pub fn scan(&mut self, style: ScanStyle, operator: BinaryOp) -> Result<&mut Self> {
        if !operator.is_associative() {
            return Err(Error::NonAssociative(operator));
        }
        let config = ScanConfig::from_config(style, operator, &self.engine.config);
        config.check_local_layout(self.engine.config.scan.work_group_size)?;
        let buffer = self.buffer.as_mut().ok_or(Error::NoDataLoaded)?;
        buffer.enqueue(Task::scan(config));
        Ok(self)
    }

    /// Materialize and return the host array.
    pub fn retrieve_integers(&mut self) -> Result<Vec<i32>> {
        self.materialize()?;
        let buffer = self.buffer.as_ref().ok_or(Error::NoDataLoaded)?;
        Ok(buffer.host().to_vec())
    }

    pub fn output(&mut self) -> Result<Vec<i32>> {
        self.retrieve_integers()
    }

    /// Materialize and convert to a host element type.
    pub fn collect<T: HostElement>(&mut self) -> Result<Vec<T>> {
        let values = self.retrieve_integers()?;
        cast::cast_all(&values)
    }

    pub fn sum(&mut self) -> Result<i32> {
        self.reduction(Reduction::Fold(BinaryOp::Add))
    }

    /// Number of elements equal to `value`.
    pub fn count(&mut self, value: i32) -> Result<usize> {
        let count = self.reduction(Reduction::Count(value))?;
        usize::try_from(count).map_err(|_| Error::Conversion {
            value: count,
            target: "usize",
        })
    }

    /// Fold the elements left to right with `operator`. `+` and `*` reduce
    /// on the device as an inclusive scan; `-` and `/` fold the host copy
    /// in order, seeded with the first element (`[100, 2, 5, 2]` with `/`
    /// gives 5). An empty buffer reduces to the operator's identity.
    pub fn reduce(&mut self, operator: BinaryOp) -> Result<i32> {
        self.reduction(Reduction::Fold(operator))
    }

    fn reduction(&mut self, key: Reduction) -> Result<i32> {
        self.materialize()?;
        let Device { engine, buffer, .. } = self;
        let buffer = buffer.as_mut().ok_or(Error::NoDataLoaded)?;
        if let Some(value) = buffer.memo(key) {
            tracing::debug!(?key, value, "reduction cache hit");
            return Ok(value);
        }

        let value = if buffer.is_empty() {
            match key {
                Reduction::Fold(op) => op.identity(),
                Reduction::Count(_) => 0,
            }
        } else {
            match key {
                Reduction::Fold(op) if !op.is_associative() => fold_in_order(buffer.host(), op)?,
                _ => engine.reduce(buffer.host(), buffer.element_type(), key)?,
            }
        };
        buffer.remember(key, value);
        Ok(value)
    }

    fn materialize(&mut self) -> Result<()> {
        let Device { kind, engine, buffer } = self;
        let buffer = buffer.as_mut().ok_or(Error::NoDataLoaded)?;
        if buffer.is_cached() {
            tracing::debug!(device = %kind, "cache hit");
            return Ok(());
        }

        if !buffer.host_is_current() {
            download(engine, buffer)?;
        }
        if buffer.pending() == 0 {
            return Ok(());
        }

        let n = buffer.len();
        if !buffer.device_is_current() {
            upload(engine, buffer)?;
        }

        let tasks = buffer.queue.drain();
        tracing::debug!(device = %kind, tasks = tasks.len(), n, "materializing");
        if let Err((err, completed)) = run_stages(engine, buffer, &tasks, n) {
            if completed > 0 {
                // Earlier stages already rewrote the device copy.
                buffer.invalidate_device();
            }
            buffer.queue.restore(tasks);
            return Err(err);
        }
        buffer.mark_device_written();

        download(engine, buffer)
    }
}

fn fold_in_order(values: &[i32], operator: BinaryOp) -> Result<i32> {
    match values.split_first() {
        Some((first, rest)) => rest
            .iter()
            .try_fold(*first, |acc, &value| operator.apply(acc, value)),
        None => Ok(operator.identity()),
    }
}

fn upload(engine: &mut Engine, buffer: &mut Buffer) -> Result<()> {
    let reusable = buffer
        .device
        .as_ref()
        .filter(|handle| handle.len() >= buffer.len())
        .cloned();
    let handle = match reusable {
        Some(handle) => handle,
        None => {
            if let Some(old) = buffer.device.take() {
                engine.bridge.release(old);
            }
            let handle = engine
                .bridge
                .allocate(buffer.len() * buffer.element_type().size_bytes())?;
            buffer.device = Some(handle.clone());
            handle
        }
    };
    engine.bridge.transfer_to_device(buffer.host(), &handle)?;
    tracing::debug!(len = buffer.len(), "uploaded to device");
    buffer.mark_uploaded();
    Ok(())
}

fn download(engine: &mut Engine, buffer: &mut Buffer) -> Result<()> {
    let handle = buffer.device.clone().ok_or_else(|| {
        Error::execution("device copy is current but was never allocated")
    })?;
    let mut data = engine.bridge.transfer_from_device(&handle)?;
    data.truncate(buffer.len());
    tracing::debug!(len = data.len(), "downloaded from device");
    buffer.store_host(data);
    Ok(())
}

/// Run every stage in order. A failure reports how many stages had
/// completed before it.
fn run_stages(
    engine: &mut Engine,
    buffer: &mut Buffer,
    tasks: &[Task],
    n: usize,
) -> std::result::Result<(), (Error, usize)> {
    for (completed, stage) in stages(tasks).iter().enumerate() {
        run_stage(engine, buffer, stage, n).map_err(|err| (err, completed))?;
    }
    Ok(())
}

fn run_stage(engine: &mut Engine, buffer: &mut Buffer, stage: &Stage<'_>, n: usize) -> Result<()> {
    let handle = buffer
        .device
        .clone()
        .ok_or_else(|| Error::execution("no device buffer to run on"))?;
    match stage {
        Stage::Fused(tasks) => {
            if n == 0 {
                return Ok(());
            }
            engine.run_fused(tasks, buffer.element_type(), &handle, n)
        }
        Stage::Scan(config) => {
            let scanned = scan::scan(engine, config, &handle, n)?;
            tracing::debug!(scan = %config.descriptor(), n, "scan stage complete");
            engine.bridge.release(handle);
            buffer.device = Some(scanned);
            Ok(())
        }
    }
}

// ─── Registry ──────────────────────────────────────────────────────

type BridgeFactory = dyn Fn(DeviceKind) -> Result<Box<dyn NativeBridge>>;

/// One lazily created device per kind.
pub struct DeviceRegistry {
    config: Config,
    factory: Box<BridgeFactory>,
    devices: HashMap<DeviceKind, Rc<RefCell<Device>>>,
}

impl DeviceRegistry {
    /// Registry with the stock bridges: the host reference bridge for
    /// the CPU and wgpu for the GPU.
    pub fn init(config: Config) -> Self {
        Self::with_bridge_factory(config, default_bridge)
    }

    pub fn with_bridge_factory<F>(config: Config, factory: F) -> Self
    where
        F: Fn(DeviceKind) -> Result<Box<dyn NativeBridge>> + 'static,
    {
        Self {
            config,
            factory: Box::new(factory),
            devices: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The device of `kind`, created on first request.
    pub fn get(&mut self, kind: DeviceKind) -> Result<Rc<RefCell<Device>>> {
        if let Some(device) = self.devices.get(&kind) {
            return Ok(Rc::clone(device));
        }
        let bridge = (self.factory)(kind)?;
        tracing::info!(device = %kind, dialect = %bridge.dialect(), "device initialised");
        let device = Rc::new(RefCell::new(Device::new(kind, bridge, self.config.clone())));
        self.devices.insert(kind, Rc::clone(&device));
        Ok(device)
    }
}

pub fn default_bridge(kind: DeviceKind) -> Result<Box<dyn NativeBridge>> {
    match kind {
        DeviceKind::Cpu => Ok(Box::new(HostBridge::new())),
        DeviceKind::Gpu => Ok(Box::new(WgpuBridge::try_new()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Device {
        Device::new(DeviceKind::Cpu, Box::new(HostBridge::new()), Config::default())
    }

    #[test]
    fn test_load_makes_no_bridge_calls() {
        let mut device = cpu();
        device.load(vec![1, 2, 3]);
        assert_eq!(device.stats().total(), 0);
        assert_eq!(device.state(), BufferState::Loaded);
        assert_eq!(device.retrieve_integers().unwrap(), vec![1, 2, 3]);
        assert_eq!(device.stats().total(), 0);
    }

    #[test]
    fn test_map_then_cache_hit() {
        let mut device = cpu();
        let out = device
            .load(vec![1, 2, 3])
            .map_fn(|x| x * 10)
            .unwrap()
            .retrieve_integers()
            .unwrap();
        assert_eq!(out, vec![10, 20, 30]);
        assert_eq!(device.state(), BufferState::Materialized);

        let before = device.stats();
        assert_eq!(device.output().unwrap(), vec![10, 20, 30]);
        assert_eq!(device.stats(), before);
    }

    #[test]
    fn test_consecutive_maps_fuse_into_one_launch() {
        let mut device = cpu();
        device
            .load((1..=10).collect::<Vec<_>>())
            .map_fn(|x| x + 1)
            .unwrap()
            .map_fn(|x| x * 2)
            .unwrap();
        assert_eq!(device.buffer().unwrap().pending(), 2);
        let out = device.retrieve_integers().unwrap();
        assert_eq!(out, (1..=10).map(|i| (i + 1) * 2).collect::<Vec<_>>());
        assert_eq!(device.stats().launches, 1);
        assert_eq!(device.stats().uploads, 1);
        assert_eq!(device.stats().downloads, 1);
    }

    #[test]
    fn test_scan_between_maps() {
        let mut device = cpu();
        let out = device
            .load(vec![1, 1, 2, 2, 2])
            .scan(ScanStyle::Exclusive, BinaryOp::Add)
            .unwrap()
            .map_fn(|x| x * 2)
            .unwrap()
            .retrieve_integers()
            .unwrap();
        assert_eq!(out, vec![0, 2, 4, 8, 12]);
    }

    #[test]
    fn test_reductions() {
        let mut device = cpu();
        device.load(vec![1, 2, 3, 4]);
        assert_eq!(device.sum().unwrap(), 10);
        assert_eq!(device.reduce(BinaryOp::Mul).unwrap(), 24);

        device.load(vec![1, 1, 2, 2, 2]);
        assert_eq!(device.count(2).unwrap(), 3);
        let calls = device.stats();
        assert_eq!(device.count(2).unwrap(), 3);
        assert_eq!(device.stats(), calls);
        assert_eq!(device.count(1).unwrap(), 2);
        assert_eq!(device.count(7).unwrap(), 0);
    }

    #[test]
    fn test_non_associative_reduce_folds_in_order() {
        let mut device = cpu();
        device.load(vec![100, 2, 5, 2]);
        assert_eq!(device.reduce(BinaryOp::Div).unwrap(), 5);
        assert_eq!(device.reduce(BinaryOp::Sub).unwrap(), 91);
        assert_eq!(device.sum().unwrap(), 109);
        assert_eq!(device.reduce(BinaryOp::Mul).unwrap(), 2000);
        assert!(device.stats().compiles > 0);

        device.load(vec![7]);
        assert_eq!(device.reduce(BinaryOp::Div).unwrap(), 7);
        device.load(vec![8, 0, 2]);
        assert!(matches!(
            device.reduce(BinaryOp::Div),
            Err(Error::ExecutionError(_))
        ));
    }

    #[test]
    fn test_non_associative_scan_is_rejected() {
        let mut device = cpu();
        device.load(vec![100, 2, 5, 2]);
        for op in [BinaryOp::Sub, BinaryOp::Div] {
            let err = device.scan(ScanStyle::Exclusive, op).unwrap_err();
            assert!(matches!(err, Error::NonAssociative(rejected) if rejected == op));
        }
        assert_eq!(device.buffer().unwrap().pending(), 0);
        assert_eq!(device.state(), BufferState::Loaded);
        assert!(device.scan(ScanStyle::Inclusive, BinaryOp::Mul).is_ok());
        assert_eq!(device.retrieve_integers().unwrap(), vec![100, 200, 1000, 2000]);
    }

    #[test]
    fn test_repeated_kernels_compile_once() {
        let mut device = cpu();
        let data: Vec<i32> = (1..=50).collect();
        device.load(data.clone()).map_fn(|x| x * 3 + 1).unwrap();
        device.retrieve_integers().unwrap();
        assert_eq!(device.count(4).unwrap(), 1);
        let warm = device.stats().compiles;

        for _ in 0..20 {
            device.load(data.clone()).map_fn(|x| x * 3 + 1).unwrap();
            device.retrieve_integers().unwrap();
            assert_eq!(device.count(4).unwrap(), 1);
        }
        assert_eq!(device.stats().compiles, warm);
        assert_eq!(device.engine.kernels.len(), warm as usize);
    }

    #[test]
    fn test_conflict_elimination_across_group_sizes() {
        let data: Vec<i32> = (0..2000).map(|i| (i % 7) - 3).collect();
        let expected: Vec<i32> = data
            .iter()
            .scan(0, |acc, &v| {
                let out = *acc;
                *acc += v;
                Some(out)
            })
            .collect();

        for banks in [1u32, 2, 4, 8, 16, 32] {
            let mut wg = 2;
            while wg <= 256 {
                let mut config = Config::default();
                config.features.avoid_bank_conflicts = true;
                config.scan.bank_count = banks;
                config.scan.work_group_size = wg;
                let fits = crate::kir::check_local_layout(wg, banks.trailing_zeros(), true).is_ok();

                let bridge = Box::new(HostBridge::new());
                let mut device = Device::new(DeviceKind::Cpu, bridge, config);
                device.load(data.clone());
                let queued = device.scan(ScanStyle::Exclusive, BinaryOp::Add);
                if fits {
                    assert!(queued.is_ok(), "banks={banks} wg={wg}");
                    let out = device.retrieve_integers().unwrap();
                    assert_eq!(out, expected, "banks={banks} wg={wg}");
                } else {
                    assert!(matches!(queued, Err(Error::Config(_))), "banks={banks} wg={wg}");
                    assert_eq!(device.buffer().unwrap().pending(), 0);
                    assert!(matches!(device.sum(), Err(Error::Config(_))));
                    assert_eq!(device.stats().total(), 0);
                }
                wg *= 2;
            }
        }
    }

    #[test]
    fn test_reductions_follow_pending_maps() {
        let mut device = cpu();
        device.load(vec![1, 2, 3, 4]);
        assert_eq!(device.sum().unwrap(), 10);
        device.map_fn(|x| x * 2).unwrap();
        assert_eq!(device.sum().unwrap(), 20);
    }

    #[test]
    fn test_empty_buffer() {
        let mut device = cpu();
        device.load(Vec::<i32>::new()).map_fn(|x| x + 1).unwrap();
        assert_eq!(device.retrieve_integers().unwrap(), Vec::<i32>::new());
        assert_eq!(device.sum().unwrap(), 0);
        assert_eq!(device.reduce(BinaryOp::Mul).unwrap(), 1);
        assert_eq!(device.count(3).unwrap(), 0);
    }

    #[test]
    fn test_operations_need_data() {
        let mut device = cpu();
        assert!(matches!(device.map_fn(|x| x + 1), Err(Error::NoDataLoaded)));
        assert!(matches!(device.retrieve_integers(), Err(Error::NoDataLoaded)));
        assert!(matches!(device.sum(), Err(Error::NoDataLoaded)));
        assert_eq!(device.state(), BufferState::Empty);
    }

    #[test]
    fn test_failed_stage_restores_queue() {
        let mut device = cpu();
        device
            .load(vec![4, 0, 2])
            .map_fn(|x| x + 1)
            .unwrap()
            .scan(ScanStyle::Exclusive, BinaryOp::Add)
            .unwrap()
            .map_fn(|x| 100 / x)
            .unwrap();
        let err = device.retrieve_integers().unwrap_err();
        assert!(matches!(err, Error::ExecutionError(_)));

        let buffer = device.buffer().unwrap();
        assert_eq!(buffer.pending(), 3);
        assert_eq!(buffer.host(), &[4, 0, 2]);
        assert!(buffer.host_is_current());
        assert!(!buffer.device_is_current());
    }

    #[test]
    fn test_load_releases_previous_buffer() {
        let mut device = cpu();
        device.load(vec![1]).map_fn(|x| x + 1).unwrap();
        device.retrieve_integers().unwrap();
        device.load(vec![2, 3]);
        assert_eq!(device.retrieve_integers().unwrap(), vec![2, 3]);
        assert_eq!(device.state(), BufferState::Loaded);
    }

    #[test]
    fn test_stage_grouping() {
        let config = ScanConfig::new(ScanStyle::Exclusive, BinaryOp::Add);
        let tasks = vec![
            Task::map(),
            Task::map(),
            Task::scan(config.clone()),
            Task::scan(config),
            Task::map(),
        ];
        let shapes: Vec<String> = stages(&tasks)
            .iter()
            .map(|stage| match stage {
                Stage::Fused(run) => format!("fused{}", run.len()),
                Stage::Scan(_) => "scan".to_string(),
            })
            .collect();
        assert_eq!(shapes, vec!["fused2", "scan", "scan", "fused1"]);
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let mut registry = DeviceRegistry::init(Config::default());
        let a = registry.get(DeviceKind::Cpu).unwrap();
        let b = registry.get(DeviceKind::Cpu).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.borrow().kind(), DeviceKind::Cpu);
    }

    #[test]
    fn test_device_kind_names() {
        assert_eq!(DeviceKind::from_name("gpu"), Some(DeviceKind::Gpu));
        assert_eq!(DeviceKind::from_name("tpu"), None);
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
    }
}
