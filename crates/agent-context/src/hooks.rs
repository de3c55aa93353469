//! Before/after execution hooks.
//!
//! Hooks are plain function values run synchronously in registration order.
//! Before-hooks can veto a unit of work; the first error stops the pipeline.
//! After-hooks are observers and always all run.

use serde_json::Value;
use std::sync::{Arc, RwLock};

use crate::context::ExecutionContext;
use crate::lock::{read, write};

/// Hook run before a unit of work. Returning an error aborts the pipeline.
pub type BeforeExecuteHook =
    Arc<dyn Fn(&ExecutionContext, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Hook run after a unit of work, given its output and error if any.
pub type AfterExecuteHook =
    Arc<dyn Fn(&ExecutionContext, &Value, Option<&anyhow::Error>) + Send + Sync>;

/// Ordered, append-only hook lists.
#[derive(Default)]
pub struct HookPipeline {
    before: RwLock<Vec<BeforeExecuteHook>>,
    after: RwLock<Vec<AfterExecuteHook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before(&self, hook: BeforeExecuteHook) {
        write(&self.before).push(hook);
    }

    pub fn add_after(&self, hook: AfterExecuteHook) {
        write(&self.after).push(hook);
    }

    pub fn before_len(&self) -> usize {
        read(&self.before).len()
    }

    pub fn after_len(&self) -> usize {
        read(&self.after).len()
    }

    /// Run before-hooks in order, returning the first error unchanged.
    ///
    /// The list is snapshotted first so hooks may register further hooks
    /// or otherwise call back into the context without deadlocking.
    pub fn run_before(&self, ctx: &ExecutionContext, input: &Value) -> anyhow::Result<()> {
        let hooks = read(&self.before).clone();
        for (index, hook) in hooks.iter().enumerate() {
            if let Err(err) = hook(ctx, input) {
                tracing::warn!(
                    hook = index,
                    registered = hooks.len(),
                    error = %err,
                    "before-execute hook rejected input"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run every after-hook in order.
    pub fn run_after(&self, ctx: &ExecutionContext, output: &Value, err: Option<&anyhow::Error>) {
        let hooks = read(&self.after).clone();
        for hook in &hooks {
            hook(ctx, output, err);
        }
    }
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("before", &self.before_len())
            .field("after", &self.after_len())
            .finish()
    }
}
