//! One dataset's host and device representations plus its pending work.

use std::collections::HashMap;
use std::fmt;

use crate::bridge::DeviceBuffer;
use crate::kir::ElementType;
use crate::parsing::BinaryOp;
use crate::tasks::{Task, TaskQueue};

/// Caching state of a buffer, derived from its freshness flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Nothing loaded.
    Empty,
    /// Host array current, device stale, nothing pending.
    Loaded,
    /// Work pending or the device holds results not yet read back.
    Stale,
    /// Both representations current after a materialization.
    Materialized,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferState::Empty => "empty",
            BufferState::Loaded => "loaded",
            BufferState::Stale => "stale",
            BufferState::Materialized => "materialized",
        };
        f.write_str(name)
    }
}

/// Memo key for reduction results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Reduction {
    Fold(BinaryOp),
    Count(i32),
}

#[derive(Debug)]
pub struct Buffer {
    element_type: ElementType,
    host: Vec<i32>,
    pub(crate) device: Option<DeviceBuffer>,
    host_is_current: bool,
    device_is_current: bool,
    materialized: bool,
    pub(crate) queue: TaskQueue,
    reductions: HashMap<Reduction, i32>,
}

impl Buffer {
    /// A freshly loaded buffer: host current, device stale.
    pub fn new(data: Vec<i32>, element_type: ElementType) -> Self {
        Self {
            element_type,
            host: data,
            device: None,
            host_is_current: true,
            device_is_current: false,
            materialized: false,
            queue: TaskQueue::new(),
            reductions: HashMap::new(),
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Last host-visible array. May lag the device while work is pending.
    pub fn host(&self) -> &[i32] {
        &self.host
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn host_is_current(&self) -> bool {
        self.host_is_current
    }

    pub fn device_is_current(&self) -> bool {
        self.device_is_current
    }

    pub fn pending(&self) -> usize {
        self.queue.size()
    }

    pub fn state(&self) -> BufferState {
        if !self.queue.is_empty() || !self.host_is_current {
            BufferState::Stale
        } else if self.materialized {
            BufferState::Materialized
        } else {
            BufferState::Loaded
        }
    }

    /// Nothing to run and nothing to read back.
    pub fn is_cached(&self) -> bool {
        self.queue.is_empty() && self.host_is_current
    }

    /// Queue a mutating task. Reduction memos no longer hold.
    pub(crate) fn enqueue(&mut self, task: Task) {
        task.enqueue_into(&mut self.queue);
        self.reductions.clear();
    }

    /// The device copy now matches the host array.
    pub(crate) fn mark_uploaded(&mut self) {
        self.device_is_current = true;
    }

    /// Kernels ran on the device copy; the host array is behind.
    pub(crate) fn mark_device_written(&mut self) {
        self.device_is_current = true;
        self.host_is_current = false;
    }

    /// A partially applied pipeline left the device copy unusable.
    pub(crate) fn invalidate_device(&mut self) {
        self.device_is_current = false;
        self.host_is_current = true;
    }

    /// Fresh results were read back; both sides agree.
    pub(crate) fn store_host(&mut self, data: Vec<i32>) {
        self.host = data;
        self.host_is_current = true;
        self.device_is_current = true;
        self.materialized = true;
    }

    pub(crate) fn memo(&self, key: Reduction) -> Option<i32> {
        self.reductions.get(&key).copied()
    }

    pub(crate) fn remember(&mut self, key: Reduction, value: i32) {
        self.reductions.insert(key, value);
    }
}
