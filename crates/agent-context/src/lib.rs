//! Execution context for agent invocations.
//!
//! This crate provides the control and observability envelope threaded
//! through every unit of agent work: cancellation and deadlines, advisory
//! resource accounting, tracing spans and before/after hooks.
//!
//! # Context Hierarchy
//!
//! ```text
//! Signal (caller-provided cancellation / deadline / values)
//!   └─ ExecutionContext (one per invocation)
//!       └─ engine contexts (one per execution environment: lua, javascript, ...)
//! ```
//!
//! # Usage
//!
//! 1. Build a root context with `ExecutionContext::new(&Signal::background(), config)`.
//! 2. Call `before_execute` / `after_execute` around the unit of work.
//! 3. Use `for_engine` to get an isolated context per engine; usage recorded
//!    there is visible in the root's ledger.
//! 4. Start spans with `start_span`, collect `Span::to_record()` and rebuild
//!    trees with `SpanTree` when exporting.
//!
//! ```rust
//! use agent_context::{Attributes, ContextConfig, ExecutionContext, Signal};
//! use std::time::Duration;
//!
//! let ctx = ExecutionContext::new(
//!     &Signal::background(),
//!     ContextConfig::builder()
//!         .timeout(Duration::from_secs(10))
//!         .max_memory(64 * 1024 * 1024)
//!         .tracing("trace-1", "")
//!         .build(),
//! );
//!
//! let lua = ctx.for_engine("lua");
//! if lua.check_memory_limit(1024) {
//!     lua.record_memory_usage(1024);
//! }
//! assert_eq!(ctx.current_memory(), 1024);
//!
//! let span = lua.start_span("lua.eval", Attributes::new());
//! span.end();
//! assert_eq!(span.trace_id(), "trace-1");
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod ledger;
mod lock;
pub mod signal;
pub mod span;
pub mod tree;

pub use config::{ContextConfig, ContextConfigBuilder, DEFAULT_TIMEOUT};
pub use context::ExecutionContext;
pub use error::{ConfigError, ContextError};
pub use hooks::{AfterExecuteHook, BeforeExecuteHook, HookPipeline};
pub use ledger::{ResourceLedger, DEFAULT_MAX_CPU, DEFAULT_MAX_MEMORY};
pub use signal::Signal;
pub use span::{Attributes, Span, SpanEvent, SpanStatus, ERROR_MESSAGE_ATTRIBUTE};
pub use tree::{SpanNode, SpanRecord, SpanTree};

/// Re-exported so callers can build signals from their own tokens.
pub use tokio_util::sync::CancellationToken;
