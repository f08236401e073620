//! Append-only trajectory of one document's tree construction.
//!
//! Steps are recorded as they happen and never edited. Aggregate statistics
//! are computed once, at [`TrajectoryRecorder::finalize`].
//!
//! Every node attempt ends in exactly one terminal step:
//! `Generation` (rejected before validation), `Validation` (rejected at
//! validation or compliance) or `Extraction` (accepted). The sum of the three
//! therefore equals accepted nodes plus rejected attempts.

use crate::model::ReasoningTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Generation,
    Validation,
    Extraction,
    Search,
    Masking,
    CircularCheck,
    Compliance,
    ExtensionAbandoned,
    Integration,
}

impl StepType {
    /// Steps that close a node attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepType::Generation | StepType::Validation | StepType::Extraction
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub index: usize,
    pub step_type: StepType,
    pub node_id: Option<Uuid>,
    pub layer: Option<usize>,
    pub inputs: Value,
    pub outputs: Value,
    pub success: bool,
    pub duration_ms: u64,
    pub search_calls: usize,
    pub validation_score: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// A step under construction, handed to [`TrajectoryRecorder::record`].
#[derive(Debug, Clone)]
pub struct StepDraft {
    step_type: StepType,
    node_id: Option<Uuid>,
    layer: Option<usize>,
    inputs: Value,
    outputs: Value,
    success: bool,
    duration: Duration,
    search_calls: usize,
    validation_score: Option<f64>,
}

impl StepDraft {
    pub fn new(step_type: StepType, success: bool) -> Self {
        Self {
            step_type,
            node_id: None,
            layer: None,
            inputs: Value::Null,
            outputs: Value::Null,
            success,
            duration: Duration::ZERO,
            search_calls: 0,
            validation_score: None,
        }
    }

    pub fn node(mut self, node_id: Uuid, layer: usize) -> Self {
        self.node_id = Some(node_id);
        self.layer = Some(layer);
        self
    }

    pub fn layer(mut self, layer: usize) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn search_calls(mut self, calls: usize) -> Self {
        self.search_calls = calls;
        self
    }

    pub fn validation_score(mut self, score: f64) -> Self {
        self.validation_score = Some(score);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrajectoryStats {
    pub total_steps: usize,
    pub success_rate: f64,
    pub average_validation_score: f64,
    pub hierarchy_compliance_rate: f64,
    pub shortcut_prevention_rate: f64,
    pub total_search_calls: usize,
    pub accepted_nodes: usize,
    pub rejected_attempts: usize,
    pub abandoned_extensions: usize,
    pub skipped_branches: usize,
    pub final_depth: usize,
    pub final_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub trajectory_id: Uuid,
    pub document_id: String,
    pub tree_id: Option<Uuid>,
    pub steps: Vec<ProcessStep>,
    pub stats: TrajectoryStats,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Trajectory {
    pub fn steps_of(&self, step_type: StepType) -> impl Iterator<Item = &ProcessStep> {
        self.steps.iter().filter(move |s| s.step_type == step_type)
    }

    pub fn count(&self, step_type: StepType) -> usize {
        self.steps_of(step_type).count()
    }

    /// Terminal steps match accepted nodes plus rejected attempts.
    pub fn reconciles(&self) -> bool {
        let terminal = self.steps.iter().filter(|s| s.step_type.is_terminal()).count();
        terminal == self.stats.accepted_nodes + self.stats.rejected_attempts
    }
}

#[derive(Debug)]
pub struct TrajectoryRecorder {
    document_id: String,
    steps: Vec<ProcessStep>,
    started_at: DateTime<Utc>,
}

impl TrajectoryRecorder {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            steps: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Append a step and return its index.
    pub fn record(&mut self, draft: StepDraft) -> usize {
        let index = self.steps.len();
        self.steps.push(ProcessStep {
            index,
            step_type: draft.step_type,
            node_id: draft.node_id,
            layer: draft.layer,
            inputs: draft.inputs,
            outputs: draft.outputs,
            success: draft.success,
            duration_ms: draft.duration.as_millis() as u64,
            search_calls: draft.search_calls,
            validation_score: draft.validation_score,
            recorded_at: Utc::now(),
        });
        index
    }

    pub fn steps(&self) -> &[ProcessStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn count(&self, step_type: StepType) -> usize {
        self.steps.iter().filter(|s| s.step_type == step_type).count()
    }

    /// Close the trajectory and compute its statistics.
    pub fn finalize(self, tree: Option<&ReasoningTree>, cancelled: bool) -> Trajectory {
        let stats = compute_stats(&self.steps, tree);
        Trajectory {
            trajectory_id: Uuid::new_v4(),
            document_id: self.document_id,
            tree_id: tree.map(|t| t.tree_id),
            steps: self.steps,
            stats,
            cancelled,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        1.0
    } else {
        part as f64 / whole as f64
    }
}

fn compute_stats(steps: &[ProcessStep], tree: Option<&ReasoningTree>) -> TrajectoryStats {
    let count = |t: StepType| steps.iter().filter(|s| s.step_type == t).count();
    let successful = steps.iter().filter(|s| s.success).count();
    let scores: Vec<f64> = steps.iter().filter_map(|s| s.validation_score).collect();
    let average_validation_score = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };

    let (hierarchy_compliance_rate, shortcut_prevention_rate, final_depth, final_size) =
        match tree {
            Some(tree) => {
                let children: Vec<_> = tree.nodes.iter().filter(|n| !n.is_root()).collect();
                let hierarchy_ok = children.iter().filter(|n| tree.hierarchy_holds(n)).count();
                let shortcut_ok = tree
                    .nodes
                    .iter()
                    .filter(|n| tree.shortcut_leak(n).is_none())
                    .count();
                (
                    ratio(hierarchy_ok, children.len()),
                    ratio(shortcut_ok, tree.len()),
                    tree.depth(),
                    tree.len(),
                )
            }
            None => (1.0, 1.0, 0, 0),
        };

    TrajectoryStats {
        total_steps: steps.len(),
        success_rate: if steps.is_empty() {
            0.0
        } else {
            successful as f64 / steps.len() as f64
        },
        average_validation_score,
        hierarchy_compliance_rate,
        shortcut_prevention_rate,
        total_search_calls: steps.iter().map(|s| s.search_calls).sum(),
        accepted_nodes: steps
            .iter()
            .filter(|s| s.step_type == StepType::Extraction && s.success)
            .count(),
        rejected_attempts: steps
            .iter()
            .filter(|s| {
                matches!(s.step_type, StepType::Generation | StepType::Validation) && !s.success
            })
            .count(),
        abandoned_extensions: count(StepType::ExtensionAbandoned),
        skipped_branches: steps
            .iter()
            .filter(|s| s.step_type == StepType::CircularCheck && !s.success)
            .count(),
        final_depth,
        final_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::node;
    use serde_json::json;

    #[test]
    fn test_record_is_append_only_and_indexed() {
        let mut rec = TrajectoryRecorder::new("doc");
        let id = Uuid::new_v4();
        assert_eq!(rec.record(StepDraft::new(StepType::Generation, false).node(id, 0)), 0);
        assert_eq!(
            rec.record(
                StepDraft::new(StepType::Search, true)
                    .layer(1)
                    .inputs(json!({"query": "NASA"}))
                    .search_calls(1)
            ),
            1
        );
        assert_eq!(rec.len(), 2);
        assert_eq!(rec.steps()[1].inputs["query"], "NASA");
        assert_eq!(rec.steps()[0].node_id, Some(id));
    }

    #[test]
    fn test_stats_and_reconciliation() {
        let mut tree = ReasoningTree::new("doc", 3);
        let root = node(None, None, "Which observatory did NASA launch?", "Hubble", &["NASA"]);
        let child = node(
            Some(&root),
            Some("NASA"),
            "Which agency was founded in 1958?",
            "NASA",
            &["1958"],
        );
        tree.accept(root.clone()).unwrap();
        tree.accept(child.clone()).unwrap();

        let mut rec = TrajectoryRecorder::new("doc");
        rec.record(StepDraft::new(StepType::Generation, false));
        rec.record(
            StepDraft::new(StepType::Extraction, true)
                .node(root.id, 0)
                .validation_score(0.9),
        );
        rec.record(StepDraft::new(StepType::CircularCheck, false).layer(1));
        rec.record(StepDraft::new(StepType::Search, true).search_calls(1));
        rec.record(StepDraft::new(StepType::Validation, false).validation_score(0.3));
        rec.record(
            StepDraft::new(StepType::Extraction, true)
                .node(child.id, 1)
                .validation_score(0.9),
        );

        let t = rec.finalize(Some(&tree), false);
        assert_eq!(t.stats.total_steps, 6);
        assert_eq!(t.stats.accepted_nodes, 2);
        assert_eq!(t.stats.rejected_attempts, 2);
        assert_eq!(t.stats.skipped_branches, 1);
        assert_eq!(t.stats.total_search_calls, 1);
        assert_eq!(t.stats.final_size, 2);
        assert_eq!(t.stats.final_depth, 1);
        assert!((t.stats.average_validation_score - 0.7).abs() < 1e-9);
        assert_eq!(t.stats.hierarchy_compliance_rate, 1.0);
        assert_eq!(t.stats.shortcut_prevention_rate, 1.0);
        assert!((t.stats.success_rate - 0.5).abs() < 1e-9);
        assert!(t.reconciles());
        assert_eq!(t.tree_id, Some(tree.tree_id));
    }

    #[test]
    fn test_finalize_without_tree() {
        let rec = TrajectoryRecorder::new("doc");
        let t = rec.finalize(None, true);
        assert!(t.cancelled);
        assert_eq!(t.stats.final_size, 0);
        assert_eq!(t.stats.success_rate, 0.0);
        assert!(t.reconciles());
    }
}
