pub mod bridge;
pub mod config;
pub mod device;
pub mod diagnostic;
pub mod error;
pub mod gpu;
pub mod kir;
pub mod parsing;
pub mod registry;
pub mod span;
pub mod tasks;

// Pipeline surface used by the CLI and tests
pub use bridge::host::HostBridge;
pub use bridge::{BridgeStats, NativeBridge};
pub use config::Config;
pub use device::{Device, DeviceKind, DeviceRegistry};
pub use error::{Error, Result};
pub use parsing::{translate, BinaryOp, ClosureTrace, Expression, Traced};
pub use registry::{DataSetRegistry, OperationRegistry};
pub use tasks::{ScanStyle, Task, TaskQueue};
