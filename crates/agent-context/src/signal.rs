//! Parent cancellation/deadline signal and the inherited value chain.
//!
//! A `Signal` is what a context is built from: a cancellation token, an
//! optional deadline and a chain of values visible to everything derived
//! from it. Any `ExecutionContext` can hand out its own signal so another
//! root context can be nested under it.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;
use crate::lock::{read, write};

/// Cancellation token plus deadline shared by a context and its engine children.
#[derive(Debug)]
pub(crate) struct Liveness {
    token: CancellationToken,
    deadline: Option<Instant>,
    cancelled_at: OnceLock<Instant>,
}

impl Liveness {
    pub(crate) fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            token,
            deadline,
            cancelled_at: OnceLock::new(),
        }
    }

    /// Derive a liveness that is cancelled with `self` but can also be
    /// cancelled on its own. The deadline is the earlier of the two. A
    /// timeout too large to represent as an `Instant` sets no local deadline.
    pub(crate) fn child(&self, timeout: Option<Duration>) -> Self {
        let local = timeout.and_then(|t| Instant::now().checked_add(t));
        let deadline = match (self.deadline, local) {
            (Some(parent), Some(local)) => Some(parent.min(local)),
            (parent, local) => parent.or(local),
        };
        Self::new(self.token.child_token(), deadline)
    }

    pub(crate) fn cancel(&self) {
        let _ = self.cancelled_at.set(Instant::now());
        self.token.cancel();
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.expired()
    }

    /// Whichever of cancellation or expiry happened first.
    pub(crate) fn err(&self) -> Option<ContextError> {
        match self.cancelled_at.get() {
            Some(at) if self.deadline.map_or(true, |d| *at < d) => Some(ContextError::Cancelled),
            Some(_) => Some(ContextError::DeadlineExceeded),
            // Cancelled through an ancestor; an ancestor deadline is never
            // earlier than ours, so expiry here means the ancestor timed out.
            None if self.token.is_cancelled() && !self.expired() => Some(ContextError::Cancelled),
            None if self.is_cancelled() => Some(ContextError::DeadlineExceeded),
            None => None,
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.token.clone();
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    }
                }
                None => token.cancelled().await,
            }
        }
    }
}

/// Values added locally, falling back to an ancestor chain.
#[derive(Debug, Default)]
pub(crate) struct ValueChain {
    local: RwLock<HashMap<String, Value>>,
    parent: Option<Arc<ValueChain>>,
}

impl ValueChain {
    pub(crate) fn new(parent: Option<Arc<ValueChain>>) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            parent,
        }
    }

    pub(crate) fn insert(&self, key: String, value: Value) {
        write(&self.local).insert(key, value);
    }

    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = read(&self.local).get(key) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(key))
    }
}

/// Parent signal a context is constructed from.
#[derive(Debug, Clone)]
pub struct Signal {
    liveness: Arc<Liveness>,
    values: Option<Arc<ValueChain>>,
}

impl Signal {
    /// A signal that is never cancelled and has no deadline or values.
    pub fn background() -> Self {
        Self {
            liveness: Arc::new(Liveness::new(CancellationToken::new(), None)),
            values: None,
        }
    }

    /// Wrap an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            liveness: Arc::new(Liveness::new(token, None)),
            values: None,
        }
    }

    pub(crate) fn from_parts(liveness: Arc<Liveness>, values: Arc<ValueChain>) -> Self {
        Self {
            liveness,
            values: Some(values),
        }
    }

    /// Derive a signal that expires after `timeout`, or at this signal's
    /// deadline if that comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            liveness: Arc::new(self.liveness.child(Some(timeout))),
            values: self.values.clone(),
        }
    }

    /// Derive a cancellable signal. Cancelling it leaves `self` live.
    pub fn child(&self) -> Self {
        Self {
            liveness: Arc::new(self.liveness.child(None)),
            values: self.values.clone(),
        }
    }

    /// Derive a signal carrying one more value.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let chain = ValueChain::new(self.values.clone());
        chain.insert(key.into(), value.into());
        Self {
            liveness: self.liveness.clone(),
            values: Some(Arc::new(chain)),
        }
    }

    pub fn cancel(&self) {
        self.liveness.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.liveness.is_cancelled()
    }

    pub fn err(&self) -> Option<ContextError> {
        self.liveness.err()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.liveness.deadline()
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.as_ref().and_then(|chain| chain.get(key))
    }

    /// Resolves once the signal is cancelled or its deadline passes.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        self.liveness.done()
    }

    /// The underlying token. Cancelling it cancels this signal.
    pub fn token(&self) -> &CancellationToken {
        self.liveness.token()
    }

    pub(crate) fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    pub(crate) fn values(&self) -> Option<&Arc<ValueChain>> {
        self.values.as_ref()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::background()
    }
}
