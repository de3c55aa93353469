//! Per-invocation execution context.
//!
//! An `ExecutionContext` bundles everything a unit of agent work is run
//! under: a cancellation signal and deadline, a resource ledger, tracing
//! state, metadata, a value chain and before/after hooks. Handles are cheap
//! to clone and every clone is the same logical context.
//!
//! # Engine contexts
//!
//! ```text
//! root context ── ledger (limits L, sees all usage)
//!   ├─ for_engine("lua")  ── ledger (parent = root ledger)
//!   └─ for_engine("js")   ── ledger (parent = root ledger)
//! ```
//!
//! Engine contexts share the root's cancellation and deadline, report usage
//! upward into the root ledger, inherit the trace lineage, and keep their own
//! metadata and hooks.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::ContextConfig;
use crate::error::ContextError;
use crate::hooks::HookPipeline;
use crate::ledger::ResourceLedger;
use crate::lock::{read, write};
use crate::signal::{Liveness, Signal, ValueChain};
use crate::span::{Attributes, Span};

/// Control and observability envelope for one agent invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    liveness: Arc<Liveness>,
    created_at: Instant,
    timeout: Option<Duration>,
    ledger: Arc<ResourceLedger>,
    values: Arc<ValueChain>,
    metadata: RwLock<HashMap<String, Value>>,
    trace_id: String,
    root_span_id: String,
    current_span: RwLock<Option<Span>>,
    // Shared with engine contexts so span ids stay unique within one invocation.
    span_counter: Arc<AtomicU64>,
    hooks: HookPipeline,
    engine: Option<String>,
    engines: RwLock<HashMap<String, ExecutionContext>>,
}

impl ExecutionContext {
    /// Create a context under `parent`.
    ///
    /// The deadline is the earlier of the parent's deadline and
    /// `now + config.timeout`. Cancelling the parent cancels this context;
    /// cancelling this context leaves the parent live.
    pub fn new(parent: &Signal, config: ContextConfig) -> Self {
        let timeout = config.effective_timeout();
        let liveness = Arc::new(parent.liveness().child(timeout));
        let ctx = Self {
            inner: Arc::new(ContextInner {
                liveness,
                created_at: Instant::now(),
                timeout,
                ledger: Arc::new(ResourceLedger::new(config.max_memory, config.max_cpu)),
                values: Arc::new(ValueChain::new(parent.values().cloned())),
                metadata: RwLock::new(config.metadata),
                trace_id: config.trace_id,
                root_span_id: config.parent_span_id,
                current_span: RwLock::new(None),
                span_counter: Arc::new(AtomicU64::new(0)),
                hooks: HookPipeline::new(),
                engine: None,
                engines: RwLock::new(HashMap::new()),
            }),
        };
        tracing::debug!(
            trace_id = %ctx.inner.trace_id,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            max_memory = ctx.inner.ledger.max_memory(),
            max_cpu = ctx.inner.ledger.max_cpu(),
            "execution context created"
        );
        ctx
    }

    /// Root context with default configuration.
    pub fn background() -> Self {
        Self::new(&Signal::background(), ContextConfig::default())
    }

    // Cancellation and deadline

    /// Cancel this context, every engine context derived from it and every
    /// context built from its [`signal`](Self::signal). Idempotent.
    pub fn cancel(&self) {
        if !self.inner.liveness.token().is_cancelled() {
            tracing::debug!(
                trace_id = %self.inner.trace_id,
                engine = self.inner.engine.as_deref(),
                "execution context cancelled"
            );
        }
        self.inner.liveness.cancel();
    }

    /// True once cancelled, once the deadline has passed, or once the parent
    /// signal is cancelled. Never goes back to false.
    pub fn is_cancelled(&self) -> bool {
        self.inner.liveness.is_cancelled()
    }

    /// Why the context is no longer live, if it isn't.
    pub fn err(&self) -> Option<ContextError> {
        self.inner.liveness.err()
    }

    /// `Ok(())` while live, otherwise the reason it stopped.
    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves at cancellation or deadline expiry, whichever comes first.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.liveness.done()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.liveness.deadline()
    }

    /// Configured local timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    /// Signal view of this context, for nesting a new root context under it.
    pub fn signal(&self) -> Signal {
        Signal::from_parts(self.inner.liveness.clone(), self.inner.values.clone())
    }

    // Values

    /// Look up a value locally, then through the ancestor chain.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.values.get(key)
    }

    /// Add a value to this context's own chain. Existing holders of this
    /// context see it; the parent does not. Returns the same context.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inner.values.insert(key.into(), value.into());
        self.clone()
    }

    // Metadata

    /// Snapshot of this context's metadata.
    pub fn metadata(&self) -> HashMap<String, Value> {
        read(&self.inner.metadata).clone()
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        read(&self.inner.metadata).get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        write(&self.inner.metadata).insert(key.into(), value.into());
    }

    // Resources

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.inner.ledger
    }

    pub fn max_memory(&self) -> i64 {
        self.inner.ledger.max_memory()
    }

    pub fn max_cpu(&self) -> i32 {
        self.inner.ledger.max_cpu()
    }

    pub fn check_memory_limit(&self, required: i64) -> bool {
        self.inner.ledger.check_memory_limit(required)
    }

    pub fn check_cpu_limit(&self, required: i32) -> bool {
        self.inner.ledger.check_cpu_limit(required)
    }

    pub fn record_memory_usage(&self, bytes: i64) {
        self.inner.ledger.record_memory_usage(bytes);
    }

    pub fn record_cpu_usage(&self, cores: i32) {
        self.inner.ledger.record_cpu_usage(cores);
    }

    pub fn release_memory(&self, bytes: i64) {
        self.inner.ledger.release_memory(bytes);
    }

    pub fn release_cpu(&self, cores: i32) {
        self.inner.ledger.release_cpu(cores);
    }

    pub fn current_memory(&self) -> i64 {
        self.inner.ledger.current_memory()
    }

    pub fn current_cpu(&self) -> i32 {
        self.inner.ledger.current_cpu()
    }

    // Tracing

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    /// Id of the current span, or the inherited root span id.
    pub fn span_id(&self) -> String {
        match read(&self.inner.current_span).as_ref() {
            Some(span) => span.span_id().to_string(),
            None => self.inner.root_span_id.clone(),
        }
    }

    /// Start a span parented to the current span.
    ///
    /// The new span does not become current; call
    /// [`set_current_span`](Self::set_current_span) to nest later spans under it.
    pub fn start_span(&self, name: impl Into<String>, attributes: Attributes) -> Span {
        let parent_id = self.span_id();
        let n = self.inner.span_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let span = Span::start(
            name,
            self.inner.trace_id.clone(),
            format!("span-{}", n),
            parent_id,
            attributes,
        );
        tracing::trace!(
            trace_id = %self.inner.trace_id,
            span_id = span.span_id(),
            parent_id = span.parent_id(),
            name = span.name(),
            "span started"
        );
        span
    }

    pub fn set_current_span(&self, span: Span) {
        *write(&self.inner.current_span) = Some(span);
    }

    pub fn current_span(&self) -> Option<Span> {
        read(&self.inner.current_span).clone()
    }

    // Engines

    /// Engine name if this is an engine-scoped context.
    pub fn engine(&self) -> Option<&str> {
        self.inner.engine.as_deref()
    }

    /// Engine-scoped child context for `engine`, created on first use.
    ///
    /// Repeated calls, including concurrent first calls, return the same
    /// instance.
    pub fn for_engine(&self, engine: &str) -> ExecutionContext {
        if let Some(child) = read(&self.inner.engines).get(engine) {
            return child.clone();
        }
        write(&self.inner.engines)
            .entry(engine.to_string())
            .or_insert_with(|| self.derive_engine(engine))
            .clone()
    }

    fn derive_engine(&self, engine: &str) -> ExecutionContext {
        let ledger = ResourceLedger::with_parent(
            self.max_memory(),
            self.max_cpu(),
            self.inner.ledger.clone(),
        );
        let child = ExecutionContext {
            inner: Arc::new(ContextInner {
                liveness: self.inner.liveness.clone(),
                created_at: Instant::now(),
                timeout: self.inner.timeout,
                ledger: Arc::new(ledger),
                values: Arc::new(ValueChain::new(Some(self.inner.values.clone()))),
                metadata: RwLock::new(HashMap::new()),
                trace_id: self.inner.trace_id.clone(),
                root_span_id: self.span_id(),
                current_span: RwLock::new(None),
                span_counter: self.inner.span_counter.clone(),
                hooks: HookPipeline::new(),
                engine: Some(engine.to_string()),
                engines: RwLock::new(HashMap::new()),
            }),
        };
        tracing::debug!(
            trace_id = %self.inner.trace_id,
            engine,
            root_span_id = %child.inner.root_span_id,
            "engine context derived"
        );
        child
    }

    /// Names of engines derived so far.
    pub fn engines(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.engines).keys().cloned().collect();
        names.sort();
        names
    }

    // Hooks

    pub fn add_before_execute_hook<F>(&self, hook: F)
    where
        F: Fn(&ExecutionContext, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.hooks.add_before(Arc::new(hook));
    }

    pub fn add_after_execute_hook<F>(&self, hook: F)
    where
        F: Fn(&ExecutionContext, &Value, Option<&anyhow::Error>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_after(Arc::new(hook));
    }

    /// Run before-hooks in registration order, stopping at the first error.
    pub fn before_execute(&self, input: &Value) -> anyhow::Result<()> {
        self.inner.hooks.run_before(self, input)
    }

    /// Run every after-hook in registration order.
    pub fn after_execute(&self, output: &Value, err: Option<&anyhow::Error>) {
        self.inner.hooks.run_after(self, output, err);
    }

    /// Whether two handles are the same logical context.
    pub fn ptr_eq(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("trace_id", &self.inner.trace_id)
            .field("span_id", &self.span_id())
            .field("engine", &self.inner.engine)
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline())
            .field("ledger", &self.inner.ledger)
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MIB: i64 = 1024 * 1024;

    fn with_config(config: ContextConfig) -> ExecutionContext {
        ExecutionContext::new(&Signal::background(), config)
    }

    #[test]
    fn test_create_with_defaults() {
        let ctx = ExecutionContext::background();
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(ctx.max_memory(), 512 * MIB);
        assert_eq!(ctx.max_cpu(), 4);
        assert_eq!(ctx.trace_id(), "");
        assert_eq!(ctx.span_id(), "");
        assert!(ctx.engine().is_none());
        assert!(ctx.deadline().is_some());
    }

    #[test]
    fn test_create_with_options() {
        let ctx = with_config(
            ContextConfig::builder()
                .timeout(Duration::from_secs(5))
                .max_memory(100 * MIB)
                .max_cpu(2)
                .tracing("trace-123", "span-456")
                .build(),
        );
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(ctx.max_memory(), 100 * MIB);
        assert_eq!(ctx.max_cpu(), 2);
        assert_eq!(ctx.trace_id(), "trace-123");
        assert_eq!(ctx.span_id(), "span-456");
    }

    #[test]
    fn test_create_with_metadata() {
        let ctx = with_config(
            ContextConfig::builder()
                .metadata_entry("user_id", "user-123")
                .metadata_entry("request_id", "req-456")
                .build(),
        );
        assert_eq!(ctx.metadata().len(), 2);
        assert_eq!(ctx.get_metadata("user_id"), Some(json!("user-123")));
        assert_eq!(ctx.get_metadata("missing"), None);

        ctx.set_metadata("user_id", "user-789");
        assert_eq!(ctx.get_metadata("user_id"), Some(json!("user-789")));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let ctx = ExecutionContext::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check().is_ok());
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn test_timeout_cancellation() {
        let ctx = with_config(ContextConfig::builder().timeout(Duration::from_millis(20)).build());
        assert!(!ctx.is_cancelled());
        std::thread::sleep(Duration::from_millis(40));
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
    }

    #[test]
    fn test_done_pending_until_cancel() {
        let ctx = with_config(ContextConfig::builder().no_timeout().build());
        let lua = ctx.for_engine("lua");
        let mut done = tokio_test::task::spawn(lua.done());
        tokio_test::assert_pending!(done.poll());

        ctx.cancel();
        assert!(done.is_woken());
        tokio_test::assert_ready!(done.poll());
    }

    #[test]
    fn test_parent_cancellation() {
        let parent = Signal::background();
        let ctx = ExecutionContext::new(&parent, ContextConfig::default());
        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_cancel_does_not_reach_parent() {
        let parent = Signal::background();
        let ctx = ExecutionContext::new(&parent, ContextConfig::default());
        ctx.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_no_deadline() {
        let ctx = with_config(ContextConfig::builder().timeout(Duration::ZERO).build());
        assert!(ctx.deadline().is_none());
        assert!(ctx.timeout().is_none());
    }

    #[test]
    fn test_unbounded_timeout_has_no_deadline() {
        let ctx = with_config(ContextConfig::builder().timeout(Duration::MAX).build());
        assert!(ctx.deadline().is_none());
        assert_eq!(ctx.timeout(), Some(Duration::MAX));
        assert!(!ctx.is_cancelled());
        assert!(ctx.for_engine("python").deadline().is_none());
    }

    #[test]
    fn test_deadline_from_timeout() {
        let before = Instant::now();
        let ctx = with_config(ContextConfig::builder().timeout(Duration::from_secs(5)).build());
        let deadline = ctx.deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(5));
        assert!(deadline <= Instant::now() + Duration::from_secs(5));
    }

    #[test]
    fn test_nested_context_takes_earliest_deadline() {
        let root = with_config(ContextConfig::builder().timeout(Duration::from_secs(10)).build());
        let child = ExecutionContext::new(
            &root.signal(),
            ContextConfig::builder().timeout(Duration::from_secs(5)).build(),
        );
        assert!(child.deadline().unwrap() < root.deadline().unwrap());

        let longer = ExecutionContext::new(
            &root.signal(),
            ContextConfig::builder().timeout(Duration::from_secs(60)).build(),
        );
        assert_eq!(longer.deadline(), root.deadline());

        root.cancel();
        assert!(child.is_cancelled());
        assert!(longer.is_cancelled());
    }

    #[test]
    fn test_values() {
        let ctx = ExecutionContext::background();
        let same = ctx.with_value("key1", "value1").with_value("key2", 123);
        assert!(same.ptr_eq(&ctx));
        assert_eq!(ctx.value("key1"), Some(json!("value1")));
        assert_eq!(ctx.value("key2"), Some(json!(123)));
        assert_eq!(ctx.value("missing"), None);
    }

    #[test]
    fn test_values_from_parent_signal() {
        let parent = Signal::background().with_value("parent_key", "parent_value");
        let ctx = ExecutionContext::new(&parent, ContextConfig::default());
        assert_eq!(ctx.value("parent_key"), Some(json!("parent_value")));

        ctx.with_value("parent_key", "override");
        assert_eq!(ctx.value("parent_key"), Some(json!("override")));
        assert_eq!(parent.value("parent_key"), Some(json!("parent_value")));
    }

    #[test]
    fn test_start_span_does_not_become_current() {
        let ctx = with_config(ContextConfig::builder().tracing("trace-1", "root").build());
        let a = ctx.start_span("a", Attributes::new());
        let b = ctx.start_span("b", Attributes::new());

        assert_eq!(a.parent_id(), "root");
        assert_eq!(b.parent_id(), "root");
        assert_eq!(a.span_id(), "span-1");
        assert_eq!(b.span_id(), "span-2");
        assert_eq!(a.trace_id(), "trace-1");
        assert!(ctx.current_span().is_none());
    }

    #[test]
    fn test_set_current_span_chains() {
        let ctx = ExecutionContext::background();
        let s1 = ctx.start_span("a", Attributes::new());
        ctx.set_current_span(s1.clone());
        let s2 = ctx.start_span("b", Attributes::new());

        assert_eq!(s2.parent_id(), s1.span_id());
        assert_eq!(ctx.span_id(), s1.span_id());
        assert!(ctx.current_span().unwrap().ptr_eq(&s1));
    }

    #[test]
    fn test_span_attributes_copied_in() {
        let ctx = ExecutionContext::background();
        let mut attrs = Attributes::new();
        attrs.insert("model".to_string(), json!("gpt"));
        let span = ctx.start_span("llm.call", attrs);
        assert_eq!(span.attribute("model"), Some(json!("gpt")));
    }

    #[test]
    fn test_engine_is_memoized() {
        let ctx = ExecutionContext::background();
        let lua = ctx.for_engine("lua");
        assert!(lua.ptr_eq(&ctx.for_engine("lua")));
        assert!(!lua.ptr_eq(&ctx.for_engine("javascript")));
        assert_eq!(lua.engine(), Some("lua"));
        assert_eq!(ctx.engines(), vec!["javascript".to_string(), "lua".to_string()]);
    }

    #[test]
    fn test_engine_metadata_and_hooks_isolated() {
        let ctx = ExecutionContext::background();
        ctx.set_metadata("owner", "root");
        ctx.add_before_execute_hook(|_, _| anyhow::bail!("root only"));

        let lua = ctx.for_engine("lua");
        assert!(lua.metadata().is_empty());
        lua.set_metadata("engine_data", "lua_specific");
        assert_eq!(ctx.get_metadata("engine_data"), None);
        assert!(lua.before_execute(&Value::Null).is_ok());
    }

    #[test]
    fn test_engine_inherits_limits_and_trace() {
        let ctx = with_config(
            ContextConfig::builder()
                .max_memory(10 * MIB)
                .max_cpu(2)
                .tracing("trace-9", "root")
                .build(),
        );
        let current = ctx.start_span("dispatch", Attributes::new());
        ctx.set_current_span(current.clone());

        let lua = ctx.for_engine("lua");
        assert_eq!(lua.max_memory(), 10 * MIB);
        assert_eq!(lua.max_cpu(), 2);
        assert_eq!(lua.trace_id(), "trace-9");
        assert_eq!(lua.span_id(), current.span_id());
        assert_eq!(lua.deadline(), ctx.deadline());

        let inner = lua.start_span("lua.eval", Attributes::new());
        assert_eq!(inner.parent_id(), current.span_id());
    }

    #[test]
    fn test_engine_values_fall_through() {
        let ctx = ExecutionContext::background();
        ctx.with_value("parent_key", "parent_value");
        let lua = ctx.for_engine("lua");
        lua.with_value("child_key", "child_value");

        assert_eq!(lua.value("parent_key"), Some(json!("parent_value")));
        assert_eq!(lua.value("child_key"), Some(json!("child_value")));
        assert_eq!(ctx.value("child_key"), None);
    }

    #[test]
    fn test_engine_resource_tracking() {
        let ctx = with_config(ContextConfig::builder().max_memory(10 * MIB).build());
        let lua = ctx.for_engine("lua");
        let js = ctx.for_engine("javascript");

        lua.record_memory_usage(3 * MIB);
        js.record_memory_usage(2 * MIB);
        assert_eq!(lua.current_memory(), 3 * MIB);
        assert_eq!(js.current_memory(), 2 * MIB);
        assert_eq!(ctx.current_memory(), 5 * MIB);

        ctx.record_memory_usage(MIB);
        assert_eq!(lua.current_memory(), 3 * MIB);
        assert_eq!(ctx.current_memory(), 6 * MIB);

        lua.release_memory(3 * MIB);
        assert_eq!(ctx.current_memory(), 3 * MIB);
    }

    #[test]
    fn test_engine_cancellation_propagation() {
        let ctx = ExecutionContext::background();
        let lua = ctx.for_engine("lua");
        let js = ctx.for_engine("javascript");
        ctx.cancel();
        assert!(lua.is_cancelled());
        assert!(js.is_cancelled());
        assert!(ctx.for_engine("late").is_cancelled());
    }

    #[test]
    fn test_hooks_can_reenter_context() {
        let ctx = ExecutionContext::background();
        ctx.add_before_execute_hook(|ctx, input| {
            ctx.set_metadata("last_input", input.clone());
            ctx.add_after_execute_hook(|_, _, _| {});
            Ok(())
        });
        ctx.before_execute(&json!("payload")).unwrap();
        assert_eq!(ctx.get_metadata("last_input"), Some(json!("payload")));
    }

    #[test]
    fn test_resources_valid_after_cancel() {
        let ctx = ExecutionContext::background();
        ctx.record_cpu_usage(2);
        ctx.cancel();
        ctx.release_cpu(1);
        assert_eq!(ctx.current_cpu(), 1);
        assert!(ctx.check_cpu_limit(3));
    }
}
