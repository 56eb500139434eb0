//! Identifiers.
//!
//! ## Rust Learning Notes
//!
//! `WorkflowId` and `ExecutionId` are thin wrappers around `Uuid`/`String`
//! rather than bare aliases. A newtype gives us a place to hang parsing and
//! `Display` logic and stops a stray `String` from being accepted where an
//! `ExecutionId` is expected, the same reasoning that motivates most
//! newtype-wrapped identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `<workflow-id>:<run-suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(workflow_id: WorkflowId, run_suffix: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", workflow_id, run_suffix.as_ref()))
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.0.split(':').next()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One segment of a [`StreamId`]: a scope name plus either a numeric
/// scatter index or the `skip` sentinel for a statically pruned branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamSegment {
    Index { scope: String, index: u32 },
    Skip { scope: String },
}

impl fmt::Display for StreamSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSegment::Index { scope, index } => write!(f, "{scope}:{index}"),
            StreamSegment::Skip { scope } => write!(f, "{scope}:skip"),
        }
    }
}

/// Hierarchical, slash-delimited path identifying a scatter/gather stream.
///
/// The root stream is always `<root>:0`. Each scatter operation appends one
/// segment per child stream it creates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(Vec<StreamSegment>);

impl StreamId {
    pub fn root() -> Self {
        Self(vec![StreamSegment::Index {
            scope: "root".to_string(),
            index: 0,
        }])
    }

    pub fn child(&self, scope: impl Into<String>, index: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(StreamSegment::Index {
            scope: scope.into(),
            index,
        });
        Self(segments)
    }

    pub fn skipped_child(&self, scope: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(StreamSegment::Skip {
            scope: scope.into(),
        });
        Self(segments)
    }

    /// The stream that owns this one, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// All ancestor streams, root first, not including `self`.
    pub fn ancestors(&self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut cur = self.clone();
        while let Some(parent) = cur.parent() {
            out.push(parent.clone());
            cur = parent;
        }
        out.reverse();
        out
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.0.last(), Some(StreamSegment::Skip { .. }))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut segments = Vec::new();
        for part in s.split('/') {
            let (scope, idx) = part.rsplit_once(':')?;
            if scope.is_empty() {
                return None;
            }
            if idx == "skip" {
                segments.push(StreamSegment::Skip {
                    scope: scope.to_string(),
                });
            } else {
                segments.push(StreamSegment::Index {
                    scope: scope.to_string(),
                    index: idx.parse().ok()?,
                });
            }
        }
        if segments.is_empty() {
            None
        } else {
            Some(Self(segments))
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", rendered.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_stream_round_trips() {
        let root = StreamId::root();
        assert_eq!(root.to_string(), "root:0");
        assert_eq!(StreamId::parse("root:0").unwrap(), root);
    }

    #[test]
    fn child_streams_nest_and_report_ancestors() {
        let root = StreamId::root();
        let child = root.child("scatter_items", 3);
        assert_eq!(child.to_string(), "root:0/scatter_items:3");
        assert_eq!(child.ancestors(), vec![root.clone()]);
        assert_eq!(child.parent(), Some(root));
    }

    #[test]
    fn skipped_child_is_not_indexable() {
        let root = StreamId::root();
        let skipped = root.skipped_child("scatter_items");
        assert!(skipped.is_skipped());
        assert_eq!(skipped.to_string(), "root:0/scatter_items:skip");
    }

    #[test]
    fn parse_rejects_malformed_segments() {
        assert!(StreamId::parse("").is_none());
        assert!(StreamId::parse(":0").is_none());
        assert!(StreamId::parse("root:notanumber").is_none());
    }
}
