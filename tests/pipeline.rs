use std::cell::Cell;
use std::rc::Rc;

use hadope::bridge::{BridgeStats, CompiledKernel, DeviceBuffer, Dialect, KernelArg};
use hadope::device::BufferState;
use hadope::{
    BinaryOp, ClosureTrace, Config, DataSetRegistry, DeviceKind, DeviceRegistry, Error,
    HostBridge, NativeBridge, OperationRegistry, ScanStyle,
};

fn registry() -> DeviceRegistry {
    DeviceRegistry::init(Config::default())
}

/// Host bridge whose first `failures` compiles are rejected.
struct FlakyBridge {
    inner: HostBridge,
    failures: Rc<Cell<u32>>,
}

impl NativeBridge for FlakyBridge {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn compile(&mut self, source: &str, entry_point: &str) -> hadope::Result<CompiledKernel> {
        if self.failures.get() > 0 {
            self.failures.set(self.failures.get() - 1);
            return Err(Error::CompilationError {
                entry_point: entry_point.to_string(),
                diagnostic: "out of resources".to_string(),
            });
        }
        self.inner.compile(source, entry_point)
    }

    fn allocate(&mut self, size_bytes: usize) -> hadope::Result<DeviceBuffer> {
        self.inner.allocate(size_bytes)
    }

    fn transfer_to_device(&mut self, data: &[i32], buffer: &DeviceBuffer) -> hadope::Result<()> {
        self.inner.transfer_to_device(data, buffer)
    }

    fn transfer_from_device(&mut self, buffer: &DeviceBuffer) -> hadope::Result<Vec<i32>> {
        self.inner.transfer_from_device(buffer)
    }

    fn launch(
        &mut self,
        kernel: &CompiledKernel,
        args: &[KernelArg],
        global_size: usize,
        local_size: Option<usize>,
    ) -> hadope::Result<()> {
        self.inner.launch(kernel, args, global_size, local_size)
    }

    fn release(&mut self, buffer: DeviceBuffer) {
        self.inner.release(buffer)
    }

    fn stats(&self) -> BridgeStats {
        self.inner.stats()
    }
}

#[test]
fn test_device_singleton_identity() {
    let mut registry = registry();
    let first = registry.get(DeviceKind::Cpu).unwrap();
    let second = registry.get(DeviceKind::Cpu).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
}

#[test]
fn test_identity_load_output() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();
    let data: Vec<i32> = (1..=100).collect();

    assert_eq!(device.load(data.clone()).output().unwrap(), data);
    assert_eq!(device.output().unwrap(), data);
    assert_eq!(device.stats().total(), 0);
}

#[test]
fn test_single_map_matches_host_map() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();
    let data: Vec<i32> = (1..=100).collect();

    let out = device
        .load(data.clone())
        .map_fn(|i| i + 1)
        .unwrap()
        .retrieve_integers()
        .unwrap();
    assert_eq!(out, data.iter().map(|i| i + 1).collect::<Vec<_>>());
}

#[test]
fn test_inverse_maps_restore_input() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();
    let data: Vec<i32> = (1..=100).collect();

    let out = device
        .load(data.clone())
        .map_fn(|i| i + 1)
        .unwrap()
        .map_fn(|i| i - 1)
        .unwrap()
        .retrieve_integers()
        .unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_second_read_is_a_cache_hit() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    device.load(vec![3, 1, 4]).map_fn(|x| x.clone() * x).unwrap();
    assert_eq!(device.state(), BufferState::Stale);
    assert_eq!(device.retrieve_integers().unwrap(), vec![9, 1, 16]);
    let after_first = device.stats();
    assert_eq!(after_first.downloads, 1);

    assert_eq!(device.retrieve_integers().unwrap(), vec![9, 1, 16]);
    assert_eq!(device.stats(), after_first);
}

#[test]
fn test_sum_and_count_are_idempotent() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    device.load(vec![1, 2, 3, 4]);
    assert_eq!(device.sum().unwrap(), 10);
    assert_eq!(device.sum().unwrap(), 10);

    device.load(vec![1, 1, 2, 2, 2]);
    assert_eq!(device.count(2).unwrap(), 3);
    assert_eq!(device.count(2).unwrap(), 3);
}

#[test]
fn test_scan_then_sum_over_many_blocks() {
    let mut config = Config::default();
    config.scan.work_group_size = 4;
    let mut registry = DeviceRegistry::init(config);
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    let data: Vec<i32> = (1..=1000).collect();
    let out = device
        .load(data.clone())
        .scan(ScanStyle::Inclusive, BinaryOp::Add)
        .unwrap()
        .retrieve_integers()
        .unwrap();
    let expected: Vec<i32> = data
        .iter()
        .scan(0, |acc, &v| {
            *acc += v;
            Some(*acc)
        })
        .collect();
    assert_eq!(out, expected);
    assert_eq!(device.sum().unwrap(), expected.iter().sum::<i32>());
}

#[test]
fn test_named_operations_and_datasets() {
    let mut datasets = DataSetRegistry::new();
    datasets.register("small", vec![-2, 0, 5]);
    let operations = OperationRegistry::with_builtins();

    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    let out = device
        .load_dataset(&datasets, "small")
        .unwrap()
        .map_named(&operations, "square")
        .unwrap()
        .map_named(&operations, "increment")
        .unwrap()
        .collect::<i64>()
        .unwrap();
    assert_eq!(out, vec![5i64, 1, 26]);

    assert!(matches!(
        device.load_dataset(&datasets, "large"),
        Err(Error::UnknownDataSet(_))
    ));
    assert!(matches!(
        device.map_named(&operations, "cube"),
        Err(Error::UnknownOperation(_))
    ));
}

#[test]
fn test_negative_values_do_not_cast_to_unsigned() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    device.load(vec![1, 2]).map_fn(|x| x - 2).unwrap();
    let err = device.collect::<u32>().unwrap_err();
    assert!(matches!(err, Error::Conversion { value: -1, target: "u32" }));
    assert_eq!(device.collect::<f64>().unwrap(), vec![-1.0, 0.0]);
}

#[test]
fn test_failed_translation_leaves_queue_untouched() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    device.load(vec![1, 2, 3]).map_fn(|x| x + 1).unwrap();
    let trace = ClosureTrace::from_disassembly(
        "0000 getlocal_WC_0 x@0\n0002 putobject 2\n0004 opt_mod <calldata!mid:%>\n0006 leave\n",
    );
    let err = device.map(&trace).unwrap_err();
    assert!(matches!(err, Error::UnsupportedInstruction { position: 2, .. }));
    assert_eq!(device.buffer().unwrap().pending(), 1);
    assert_eq!(device.retrieve_integers().unwrap(), vec![2, 3, 4]);
}

#[test]
fn test_compile_failure_is_retryable() {
    let failures = Rc::new(Cell::new(1));
    let handle = Rc::clone(&failures);
    let mut registry = DeviceRegistry::with_bridge_factory(Config::default(), move |_| {
        Ok(Box::new(FlakyBridge {
            inner: HostBridge::new(),
            failures: Rc::clone(&handle),
        }) as Box<dyn NativeBridge>)
    });
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    device.load(vec![1, 2, 3]).map_fn(|x| x * 3).unwrap();
    let err = device.retrieve_integers().unwrap_err();
    assert!(matches!(err, Error::CompilationError { .. }));
    assert_eq!(failures.get(), 0);
    assert_eq!(device.state(), BufferState::Stale);
    assert_eq!(device.buffer().unwrap().pending(), 1);

    assert_eq!(device.retrieve_integers().unwrap(), vec![3, 6, 9]);
    assert_eq!(device.state(), BufferState::Materialized);
}

#[test]
fn test_config_file_drives_scan_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hadope.toml");
    std::fs::write(
        &path,
        "[features]\navoid_bank_conflicts = true\n\n[scan]\nbanks = 16\nwork_group_size = 8\n",
    )
    .unwrap();
    let config = Config::load(&path).unwrap();
    assert!(config.features.avoid_bank_conflicts);
    assert_eq!(config.scan.bank_count, 16);

    let mut registry = DeviceRegistry::init(config);
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();
    let data: Vec<i32> = (0..100).map(|i| i % 3).collect();
    device.load(data.clone());
    assert_eq!(device.sum().unwrap(), data.iter().sum::<i32>());
    assert_eq!(device.count(0).unwrap(), data.iter().filter(|&&v| v == 0).count());
}

#[test]
fn test_reduce_with_division_folds_left_to_right() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    device.load(vec![100, 2, 5, 2]);
    assert_eq!(device.reduce(BinaryOp::Div).unwrap(), 5);
    assert_eq!(device.reduce(BinaryOp::Sub).unwrap(), 91);
    assert_eq!(device.reduce(BinaryOp::Add).unwrap(), 109);
    assert!(matches!(
        device.scan(ScanStyle::Inclusive, BinaryOp::Div),
        Err(Error::NonAssociative(BinaryOp::Div))
    ));
}

#[test]
fn test_identical_pipelines_reuse_compiled_kernels() {
    let mut registry = registry();
    let device = registry.get(DeviceKind::Cpu).unwrap();
    let mut device = device.borrow_mut();

    // 101 = 2 * 51 - 1 lies in every window below.
    let run = |device: &mut hadope::Device, seed: i32| {
        let data: Vec<i32> = (seed..seed + 64).collect();
        device.load(data).map_fn(|x| x * 2 - 1).unwrap();
        device.retrieve_integers().unwrap();
        device.count(101).unwrap()
    };

    assert_eq!(run(&mut *device, 1), 1);
    let compiles = device.stats().compiles;
    for seed in 2..=50 {
        assert_eq!(run(&mut *device, seed), 1);
    }
    assert_eq!(device.stats().compiles, compiles);
}
