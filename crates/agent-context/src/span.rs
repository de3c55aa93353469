//! Tracing spans started from an execution context.
//!
//! A `Span` is a cheap handle to shared state, so the copy held as the
//! context's current span and the copy held by the caller see the same
//! attributes, events and end time. Spans link to their predecessor only
//! through `parent_id`; trees are rebuilt out-of-band (see [`crate::tree`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::lock::{read, write};
use crate::tree::SpanRecord;

/// Attribute map carried by spans and span events.
pub type Attributes = HashMap<String, serde_json::Value>;

/// Attribute key under which `record_error` stores the message.
pub const ERROR_MESSAGE_ATTRIBUTE: &str = "error.message";

/// Status of a span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Ok,
    Error,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
        }
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped event recorded within a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: Attributes,
}

/// A single traced operation.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

struct SpanInner {
    name: String,
    trace_id: String,
    span_id: String,
    parent_id: String,
    started_at: DateTime<Utc>,
    start: Instant,
    state: RwLock<SpanState>,
}

#[derive(Default)]
struct SpanState {
    attributes: Attributes,
    events: Vec<SpanEvent>,
    status: SpanStatus,
    ended: Option<(DateTime<Utc>, Instant)>,
}

impl Span {
    pub(crate) fn start(
        name: impl Into<String>,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        Self {
            inner: Arc::new(SpanInner {
                name: name.into(),
                trace_id: trace_id.into(),
                span_id: span_id.into(),
                parent_id: parent_id.into(),
                started_at: Utc::now(),
                start: Instant::now(),
                state: RwLock::new(SpanState {
                    attributes,
                    ..SpanState::default()
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.inner.span_id
    }

    /// Span id of whatever was current on the context when this span started.
    pub fn parent_id(&self) -> &str {
        &self.inner.parent_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Snapshot of the attributes.
    pub fn attributes(&self) -> Attributes {
        read(&self.inner.state).attributes.clone()
    }

    pub fn attribute(&self, key: &str) -> Option<serde_json::Value> {
        read(&self.inner.state).attributes.get(key).cloned()
    }

    /// Set an attribute, overwriting any previous value for `key`.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        write(&self.inner.state)
            .attributes
            .insert(key.into(), value.into());
    }

    /// Append an event. Events are never overwritten.
    pub fn add_event(&self, name: impl Into<String>, attributes: Attributes) {
        write(&self.inner.state).events.push(SpanEvent {
            name: name.into(),
            timestamp: Utc::now(),
            attributes,
        });
    }

    pub fn events(&self) -> Vec<SpanEvent> {
        read(&self.inner.state).events.clone()
    }

    /// Mark the span as failed. The status stays `Error` from here on;
    /// a later call only replaces the stored message.
    pub fn record_error<E: fmt::Display + ?Sized>(&self, err: &E) {
        let mut state = write(&self.inner.state);
        state.status = SpanStatus::Error;
        state.attributes.insert(
            ERROR_MESSAGE_ATTRIBUTE.to_string(),
            serde_json::Value::String(err.to_string()),
        );
    }

    pub fn has_error(&self) -> bool {
        self.status() == SpanStatus::Error
    }

    pub fn status(&self) -> SpanStatus {
        read(&self.inner.state).status
    }

    /// End the span. Only the first call has an effect.
    pub fn end(&self) {
        let mut state = write(&self.inner.state);
        if state.ended.is_none() {
            state.ended = Some((Utc::now(), Instant::now()));
        }
    }

    pub fn is_ended(&self) -> bool {
        read(&self.inner.state).ended.is_some()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        read(&self.inner.state).ended.map(|(at, _)| at)
    }

    /// Elapsed time until `end()`, or until now if the span is still open.
    pub fn duration(&self) -> Duration {
        self.duration_in(&read(&self.inner.state))
    }

    fn duration_in(&self, state: &SpanState) -> Duration {
        match state.ended {
            Some((_, end)) => end.duration_since(self.inner.start),
            None => self.inner.start.elapsed(),
        }
    }

    /// Whether two handles refer to the same span.
    pub fn ptr_eq(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Serializable snapshot for exporters.
    pub fn to_record(&self) -> SpanRecord {
        let state = read(&self.inner.state);
        let duration = self.duration_in(&state);
        SpanRecord {
            name: self.inner.name.clone(),
            trace_id: self.inner.trace_id.clone(),
            span_id: self.inner.span_id.clone(),
            parent_id: self.inner.parent_id.clone(),
            status: state.status,
            started_at: self.inner.started_at,
            ended_at: state.ended.map(|(at, _)| at),
            duration_ms: duration.as_millis() as u64,
            attributes: state.attributes.clone(),
            events: state.events.clone(),
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.inner.name)
            .field("trace_id", &self.inner.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("parent_id", &self.inner.parent_id)
            .field("status", &self.status())
            .field("ended", &self.is_ended())
            .finish()
    }
}
