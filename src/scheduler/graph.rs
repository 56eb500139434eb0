//! Dependency graph bookkeeping: adjacency, indegree, and edge marks.
//!
//! Grounded on `tracecat/dsl/scheduler.py`'s `DSLScheduler`: an adjacency
//! map keyed by parent ref to `(child, edge_type)` pairs, an `EdgeMarker`
//! per `(parent, child, edge_type)` tuple, and per-child counters that
//! decide reachability according to its `join_strategy`.

use std::collections::HashMap;

use crate::model::{ActionStatement, EdgeType, JoinStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeMarker {
    Pending,
    Visited,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Skipped,
}

#[derive(Default)]
struct ChildCounters {
    indegree: u32,
    visited: u32,
    skipped: u32,
    dispatched: bool,
}

pub struct TaskGraph {
    statements: HashMap<String, ActionStatement>,
    /// parent -> (child, edge_type)
    adjacency: HashMap<String, Vec<(String, EdgeType)>>,
    marks: HashMap<(String, String, EdgeType), EdgeMarker>,
    counters: HashMap<String, ChildCounters>,
}

impl TaskGraph {
    pub fn new(statements: Vec<ActionStatement>) -> Self {
        let mut adjacency: HashMap<String, Vec<(String, EdgeType)>> = HashMap::new();
        let mut counters: HashMap<String, ChildCounters> = HashMap::new();
        let mut marks = HashMap::new();

        for stmt in &statements {
            counters.entry(stmt.ref_.clone()).or_default();
            for dep in stmt.dependencies() {
                adjacency
                    .entry(dep.ref_.clone())
                    .or_default()
                    .push((stmt.ref_.clone(), dep.edge_type));
                marks.insert(
                    (dep.ref_.clone(), stmt.ref_.clone(), dep.edge_type),
                    EdgeMarker::Pending,
                );
                counters.entry(stmt.ref_.clone()).or_default().indegree += 1;
            }
        }

        let statements = statements.into_iter().map(|s| (s.ref_.clone(), s)).collect();
        Self {
            statements,
            adjacency,
            marks,
            counters,
        }
    }

    pub fn statement(&self, ref_: &str) -> Option<&ActionStatement> {
        self.statements.get(ref_)
    }

    /// Refs with no incoming edges — the initial dispatch set.
    pub fn roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .counters
            .iter()
            .filter(|(_, c)| c.indegree == 0)
            .map(|(r, _)| r.clone())
            .collect();
        roots.sort();
        roots
    }

    /// Applies a completed task's outcome to its outgoing edges and returns
    /// the children newly made ready to dispatch (deterministically sorted)
    /// plus the children that became unreachable and should be recorded as
    /// skipped in their own right.
    pub fn complete(&mut self, ref_: &str, outcome: TaskOutcome) -> (Vec<String>, Vec<String>) {
        let edges = self.adjacency.get(ref_).cloned().unwrap_or_default();
        let mut ready = Vec::new();
        let mut newly_skipped = Vec::new();

        for (child, edge_type) in edges {
            let visits_this_edge = match (outcome, edge_type) {
                (TaskOutcome::Completed, EdgeType::Success) => true,
                (TaskOutcome::Failed, EdgeType::Error) => true,
                _ => false,
            };
            let marker = if outcome == TaskOutcome::Skipped {
                EdgeMarker::Skipped
            } else if visits_this_edge {
                EdgeMarker::Visited
            } else {
                EdgeMarker::Skipped
            };
            self.marks.insert((ref_.to_string(), child.clone(), edge_type), marker);

            let counters = self.counters.get_mut(&child).expect("child tracked at construction");
            if counters.dispatched {
                continue;
            }
            match marker {
                EdgeMarker::Visited => counters.visited += 1,
                EdgeMarker::Skipped => counters.skipped += 1,
                EdgeMarker::Pending => unreachable!(),
            }

            let join = self
                .statements
                .get(&child)
                .map(|s| s.join_strategy)
                .unwrap_or(JoinStrategy::All);
            let decided = counters.visited + counters.skipped;

            match join {
                JoinStrategy::Any => {
                    if counters.visited >= 1 {
                        counters.dispatched = true;
                        ready.push(child.clone());
                    } else if decided == counters.indegree {
                        counters.dispatched = true;
                        newly_skipped.push(child.clone());
                    }
                }
                JoinStrategy::All => {
                    if decided == counters.indegree {
                        counters.dispatched = true;
                        if counters.skipped == 0 {
                            ready.push(child.clone());
                        } else {
                            newly_skipped.push(child.clone());
                        }
                    }
                }
            }
        }

        ready.sort();
        newly_skipped.sort();
        (ready, newly_skipped)
    }

    pub fn edge_marker(&self, parent: &str, child: &str, edge_type: EdgeType) -> Option<EdgeMarker> {
        self.marks.get(&(parent.to_string(), child.to_string(), edge_type)).copied()
    }

    /// Whether any child depends on `ref_` via an `.error` edge — if so, a
    /// failure of `ref_` is recoverable and must not abort the run.
    pub fn has_outgoing_error_edge(&self, ref_: &str) -> bool {
        self.adjacency
            .get(ref_)
            .map(|edges| edges.iter().any(|(_, edge_type)| *edge_type == EdgeType::Error))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RetryPolicy;
    use std::collections::HashMap as Map;

    fn stmt(ref_: &str, depends_on: Vec<&str>, join: JoinStrategy) -> ActionStatement {
        ActionStatement {
            ref_: ref_.to_string(),
            action: "core.noop".to_string(),
            args: Map::new(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            run_if: None,
            for_each: None,
            retry_policy: RetryPolicy::default(),
            start_delay_secs: 0,
            wait_until: None,
            join_strategy: join,
            environment: None,
            scatter: None,
        }
    }

    #[test]
    fn roots_have_no_dependencies() {
        let graph = TaskGraph::new(vec![
            stmt("a", vec![], JoinStrategy::All),
            stmt("b", vec!["a"], JoinStrategy::All),
        ]);
        assert_eq!(graph.roots(), vec!["a".to_string()]);
    }

    #[test]
    fn success_unlocks_success_edge_child() {
        let mut graph = TaskGraph::new(vec![
            stmt("a", vec![], JoinStrategy::All),
            stmt("b", vec!["a"], JoinStrategy::All),
        ]);
        let (ready, skipped) = graph.complete("a", TaskOutcome::Completed);
        assert_eq!(ready, vec!["b".to_string()]);
        assert!(skipped.is_empty());
    }

    #[test]
    fn failure_without_error_edge_skips_child() {
        let mut graph = TaskGraph::new(vec![
            stmt("a", vec![], JoinStrategy::All),
            stmt("b", vec!["a"], JoinStrategy::All),
        ]);
        let (ready, skipped) = graph.complete("a", TaskOutcome::Failed);
        assert!(ready.is_empty());
        assert_eq!(skipped, vec!["b".to_string()]);
    }

    #[test]
    fn any_join_fires_once_first_parent_succeeds() {
        let mut graph = TaskGraph::new(vec![
            stmt("a", vec![], JoinStrategy::All),
            stmt("b", vec![], JoinStrategy::All),
            stmt("c", vec!["a", "b"], JoinStrategy::Any),
        ]);
        let (ready, _) = graph.complete("a", TaskOutcome::Completed);
        assert_eq!(ready, vec!["c".to_string()]);
        // second parent completing must not re-dispatch c
        let (ready2, _) = graph.complete("b", TaskOutcome::Completed);
        assert!(ready2.is_empty());
    }

    #[test]
    fn all_join_requires_every_parent_to_succeed() {
        let mut graph = TaskGraph::new(vec![
            stmt("a", vec![], JoinStrategy::All),
            stmt("b", vec![], JoinStrategy::All),
            stmt("c", vec!["a", "b"], JoinStrategy::All),
        ]);
        let (ready, _) = graph.complete("a", TaskOutcome::Completed);
        assert!(ready.is_empty());
        let (ready2, _) = graph.complete("b", TaskOutcome::Completed);
        assert_eq!(ready2, vec!["c".to_string()]);
    }

    #[test]
    fn all_join_skips_child_if_any_parent_skipped() {
        let mut graph = TaskGraph::new(vec![
            stmt("a", vec![], JoinStrategy::All),
            stmt("b", vec![], JoinStrategy::All),
            stmt("c", vec!["a", "b"], JoinStrategy::All),
        ]);
        graph.complete("a", TaskOutcome::Skipped);
        let (ready, skipped) = graph.complete("b", TaskOutcome::Completed);
        assert!(ready.is_empty());
        assert_eq!(skipped, vec!["c".to_string()]);
    }
}
