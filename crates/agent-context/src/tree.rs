//! Span export records and out-of-band tree reconstruction.
//!
//! Spans only know their `parent_id`. Exporters collect `SpanRecord`s and
//! use `SpanTree` to nest them back into a hierarchy; spans themselves never
//! hold child lists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::span::{Attributes, SpanEvent, SpanStatus};

/// Serializable snapshot of a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: String,
    pub status: SpanStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
}

/// A record together with the records that name it as parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanNode {
    #[serde(flatten)]
    pub span: SpanRecord,
    pub children: Vec<SpanNode>,
}

impl SpanNode {
    /// Number of spans in this subtree, including this one.
    pub fn span_count(&self) -> usize {
        1 + self.children.iter().map(SpanNode::span_count).sum::<usize>()
    }

    /// Whether this span or any descendant recorded an error.
    pub fn has_error(&self) -> bool {
        self.span.status == SpanStatus::Error || self.children.iter().any(SpanNode::has_error)
    }
}

/// Builds span trees from flat records.
///
/// Records are grouped by `(trace_id, parent_id)`. A record whose parent is
/// not among the collected records becomes a root. Siblings are ordered by
/// start time.
#[derive(Debug, Default)]
pub struct SpanTree {
    records: Vec<SpanRecord>,
}

impl SpanTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collected record.
    pub fn add(&mut self, record: SpanRecord) {
        self.records.push(record);
    }

    /// Reconstruct every tree present in `records`.
    pub fn build(records: impl IntoIterator<Item = SpanRecord>) -> Vec<SpanNode> {
        let mut tree = Self::new();
        for record in records {
            tree.add(record);
        }
        tree.finalize()
    }

    /// Consume the collected records and return the root nodes.
    pub fn finalize(self) -> Vec<SpanNode> {
        let known: HashSet<(String, String)> = self
            .records
            .iter()
            .map(|r| (r.trace_id.clone(), r.span_id.clone()))
            .collect();

        let mut roots = Vec::new();
        let mut by_parent: HashMap<(String, String), Vec<SpanRecord>> = HashMap::new();
        for record in self.records {
            let parent_key = (record.trace_id.clone(), record.parent_id.clone());
            // A span whose id equals its parent id would otherwise nest under itself.
            if known.contains(&parent_key) && record.parent_id != record.span_id {
                by_parent.entry(parent_key).or_default().push(record);
            } else {
                roots.push(record);
            }
        }

        roots.sort_by_key(|r| r.started_at);
        let mut nodes: Vec<SpanNode> = roots
            .into_iter()
            .map(|record| attach(record, &mut by_parent))
            .collect();

        // Parent links that form a cycle are unreachable from any root.
        let mut stranded: Vec<SpanRecord> = by_parent.drain().flat_map(|(_, v)| v).collect();
        stranded.sort_by_key(|r| r.started_at);
        nodes.extend(stranded.into_iter().map(|span| SpanNode {
            span,
            children: Vec::new(),
        }));
        nodes
    }
}

fn attach(span: SpanRecord, by_parent: &mut HashMap<(String, String), Vec<SpanRecord>>) -> SpanNode {
    let mut children = by_parent
        .remove(&(span.trace_id.clone(), span.span_id.clone()))
        .unwrap_or_default();
    children.sort_by_key(|r| r.started_at);
    let children = children
        .into_iter()
        .map(|child| attach(child, by_parent))
        .collect();
    SpanNode { span, children }
}
