//! Hierarchical resource accounting.
//!
//! A `ResourceLedger` tracks memory and CPU usage against its own limits.
//! Usage deltas are applied to every ancestor ledger as well, so a parent
//! always sees the sum of what its engine children hold. Limits are advisory:
//! recording never fails, and callers are expected to check before they act.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

/// Default memory limit in bytes (512 MiB)
pub const DEFAULT_MAX_MEMORY: i64 = 512 * 1024 * 1024;

/// Default CPU limit in cores
pub const DEFAULT_MAX_CPU: i32 = 4;

/// Atomic usage counters bounded by configured limits.
#[derive(Debug)]
pub struct ResourceLedger {
    max_memory: i64,
    max_cpu: i32,
    used_memory: AtomicI64,
    used_cpu: AtomicI32,
    parent: Option<Arc<ResourceLedger>>,
}

impl ResourceLedger {
    /// Create a root ledger with the given limits.
    pub fn new(max_memory: i64, max_cpu: i32) -> Self {
        Self {
            max_memory,
            max_cpu,
            used_memory: AtomicI64::new(0),
            used_cpu: AtomicI32::new(0),
            parent: None,
        }
    }

    /// Create a ledger whose usage changes are also applied to `parent`.
    ///
    /// The parent's limits are not consulted; this ledger only enforces
    /// `max_memory` and `max_cpu`.
    pub fn with_parent(max_memory: i64, max_cpu: i32, parent: Arc<ResourceLedger>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(max_memory, max_cpu)
        }
    }

    pub fn max_memory(&self) -> i64 {
        self.max_memory
    }

    pub fn max_cpu(&self) -> i32 {
        self.max_cpu
    }

    pub fn parent(&self) -> Option<&Arc<ResourceLedger>> {
        self.parent.as_ref()
    }

    /// Returns true if `required` more bytes fit under this ledger's limit.
    pub fn check_memory_limit(&self, required: i64) -> bool {
        self.current_memory().saturating_add(required) <= self.max_memory
    }

    /// Returns true if `required` more cores fit under this ledger's limit.
    pub fn check_cpu_limit(&self, required: i32) -> bool {
        self.current_cpu().saturating_add(required) <= self.max_cpu
    }

    /// Add `bytes` to this ledger and every ancestor. Never rejects.
    pub fn record_memory_usage(&self, bytes: i64) {
        self.apply_memory(bytes);
    }

    /// Add `cores` to this ledger and every ancestor. Never rejects.
    pub fn record_cpu_usage(&self, cores: i32) {
        self.apply_cpu(cores);
    }

    pub fn release_memory(&self, bytes: i64) {
        self.apply_memory(bytes.wrapping_neg());
    }

    pub fn release_cpu(&self, cores: i32) {
        self.apply_cpu(cores.wrapping_neg());
    }

    pub fn current_memory(&self) -> i64 {
        self.used_memory.load(Ordering::SeqCst)
    }

    pub fn current_cpu(&self) -> i32 {
        self.used_cpu.load(Ordering::SeqCst)
    }

    // Counters wrap on overflow like the underlying atomics.
    fn apply_memory(&self, delta: i64) {
        let mut ledger = Some(self);
        while let Some(current) = ledger {
            let used = current.used_memory.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta);
            tracing::trace!(delta, used, max = current.max_memory, "memory usage updated");
            ledger = current.parent.as_deref();
        }
    }

    fn apply_cpu(&self, delta: i32) {
        let mut ledger = Some(self);
        while let Some(current) = ledger {
            let used = current.used_cpu.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta);
            tracing::trace!(delta, used, max = current.max_cpu, "cpu usage updated");
            ledger = current.parent.as_deref();
        }
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMORY, DEFAULT_MAX_CPU)
    }
}
