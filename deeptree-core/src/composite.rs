//! Composite question integration.
//!
//! A finished tree collapses into questions whose single answer is the root
//! answer. The nested-cumulative form is built mechanically: each accepted
//! child replaces its parent keyword in the parent question with a bracketed
//! reference to its own (already nested) question, deepest layer first. It is
//! always produced. Model paraphrases of the nested form are optional and are
//! discarded when they are not questions or leak any answer of the chain.

use crate::brain::Brain;
use crate::judgment;
use crate::keywords;
use crate::model::{QuestionNode, ReasoningTree};
use crate::prompts;
use crate::text;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeKind {
    NestedCumulative,
    LlmIntegrated,
    AmbiguousIntegrated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeTier {
    /// Mechanical template output.
    Fallback,
    /// Model-generated paraphrase.
    Production,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub node_id: Uuid,
    pub layer: usize,
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeQuery {
    pub id: Uuid,
    pub kind: CompositeKind,
    pub tier: CompositeTier,
    pub question: String,
    /// Nested-cumulative form the question was derived from.
    pub nested_form: String,
    /// Innermost step first; the root is last.
    pub reasoning_chain: Vec<ReasoningStep>,
    pub answer: String,
}

impl CompositeQuery {
    pub fn hops(&self) -> usize {
        self.reasoning_chain.len()
    }

    /// Substitute each step's answer for its bracketed reference, innermost
    /// first. The result is the root question.
    pub fn resolve_nested(&self) -> String {
        self.resolve().0
    }

    /// Resolution plus whether every step's reference was found.
    fn resolve(&self) -> (String, bool) {
        let mut resolved = self.nested_form.clone();
        let Some((_, inner)) = self.reasoning_chain.split_last() else {
            return (resolved, true);
        };
        let mut complete = true;
        for step in inner {
            let reference = reference_to(&step.question);
            match resolved.find(&reference) {
                Some(pos) => resolved.replace_range(pos..pos + reference.len(), &step.answer),
                None => {
                    warn!(node_id = %step.node_id, "Reasoning step not found in nested form");
                    complete = false;
                }
            }
        }
        (resolved, complete)
    }

    /// Every step resolves, resolution reproduces the root question, and the
    /// composite answer is the root answer.
    pub fn verify_round_trip(&self) -> bool {
        let (resolved, complete) = self.resolve();
        match self.reasoning_chain.last() {
            Some(root) => complete && resolved == root.question && self.answer == root.answer,
            None => false,
        }
    }
}

/// `[the answer to "<question without ?>"]`
pub fn reference_to(question: &str) -> String {
    format!(
        "[the answer to \"{}\"]",
        question.trim().trim_end_matches('?').trim_end()
    )
}

/// Nested question for `node`, with every descendant folded in. Ids of the
/// nodes that made it into the text are collected in `included`.
fn nest(tree: &ReasoningTree, node: &QuestionNode, included: &mut HashSet<Uuid>) -> String {
    included.insert(node.id);
    // splice at offsets of the original question, right to left, so inserted
    // text is never searched for a sibling keyword
    let mut spans: Vec<(usize, usize, &QuestionNode)> = tree
        .children(node.id)
        .into_iter()
        .filter_map(|child| {
            let keyword = child.parent_keyword.as_deref()?;
            let start = keywords::locate(&node.question_text, keyword)?;
            Some((start, keyword.len(), child))
        })
        .collect();
    spans.sort_by(|a, b| b.0.cmp(&a.0));
    let mut nested = node.question_text.clone();
    let mut last_start = usize::MAX;
    for (start, len, child) in spans {
        if start + len > last_start {
            warn!(node_id = %child.id, "Keyword span overlaps a sibling, subtree left out");
            continue;
        }
        let inner = nest(tree, child, included);
        nested.replace_range(start..start + len, &reference_to(&inner));
        last_start = start;
    }
    nested
}

/// Nodes in `included`, innermost first: deepest layer first, then
/// acceptance order.
fn reasoning_chain(tree: &ReasoningTree, included: &HashSet<Uuid>) -> Vec<ReasoningStep> {
    let mut nodes: Vec<&QuestionNode> = tree
        .nodes
        .iter()
        .filter(|n| included.contains(&n.id))
        .collect();
    nodes.sort_by(|a, b| b.layer_level.cmp(&a.layer_level));
    nodes
        .into_iter()
        .map(|n| ReasoningStep {
            node_id: n.id,
            layer: n.layer_level,
            question: n.question_text.clone(),
            answer: n.answer.clone(),
        })
        .collect()
}

/// The mechanical composite, or `None` for a tree without a root.
pub fn nested_cumulative(tree: &ReasoningTree) -> Option<CompositeQuery> {
    let root = tree.root()?;
    let mut included = HashSet::new();
    let nested = nest(tree, root, &mut included);
    Some(CompositeQuery {
        id: Uuid::new_v4(),
        kind: CompositeKind::NestedCumulative,
        tier: CompositeTier::Fallback,
        question: nested.clone(),
        nested_form: nested,
        reasoning_chain: reasoning_chain(tree, &included),
        answer: root.answer.clone(),
    })
}

pub struct CompositeIntegrator {
    brain: Option<Arc<Brain>>,
    llm_integrated: bool,
    ambiguous: bool,
}

impl CompositeIntegrator {
    pub fn new(brain: Option<Arc<Brain>>, llm_integrated: bool, ambiguous: bool) -> Self {
        Self {
            brain,
            llm_integrated,
            ambiguous,
        }
    }

    /// Mechanical composites only.
    pub fn mechanical() -> Self {
        Self::new(None, false, false)
    }

    pub async fn integrate(&self, tree: &ReasoningTree) -> Vec<CompositeQuery> {
        let Some(base) = nested_cumulative(tree) else {
            return Vec::new();
        };
        let mut out = vec![base.clone()];
        // a single hop has nothing to paraphrase
        if base.hops() < 2 {
            return out;
        }
        let Some(brain) = &self.brain else {
            return out;
        };

        let chain_text = base
            .reasoning_chain
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {} -> {}", i + 1, s.question, s.answer))
            .collect::<Vec<_>>()
            .join("\n");
        let mut variants = Vec::new();
        if self.llm_integrated {
            variants.push((
                CompositeKind::LlmIntegrated,
                prompts::composite_integration(&base.nested_form, &chain_text, &base.answer),
            ));
        }
        if self.ambiguous {
            variants.push((
                CompositeKind::AmbiguousIntegrated,
                prompts::composite_ambiguous(&base.nested_form, &chain_text, &base.answer),
            ));
        }

        for (kind, prompt) in variants {
            let reply = match brain.generate(prompts::SYSTEM_QUESTION_WRITER, prompt).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(?kind, error = %e, "Composite paraphrase call failed");
                    continue;
                }
            };
            let Some((question, _)) = judgment::parse_question(&reply) else {
                debug!(?kind, "Composite paraphrase unparseable, discarded");
                continue;
            };
            if let Some(leak) = base
                .reasoning_chain
                .iter()
                .find(|s| text::contains_phrase(&question, &s.answer))
            {
                debug!(?kind, leaked = %leak.answer, "Composite paraphrase leaks an answer, discarded");
                continue;
            }
            out.push(CompositeQuery {
                id: Uuid::new_v4(),
                kind,
                tier: CompositeTier::Production,
                question,
                ..base.clone()
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::model::tests::node;
    use pretty_assertions::assert_eq;

    fn three_layer_tree() -> ReasoningTree {
        let mut tree = ReasoningTree::new("doc", 3);
        let root = node(
            None,
            None,
            "Which observatory did NASA deploy from Discovery?",
            "Hubble",
            &["NASA", "Discovery"],
        );
        let nasa = node(
            Some(&root),
            Some("NASA"),
            "Which agency founded in 1958 operates the Goddard center?",
            "NASA",
            &["1958", "Goddard"],
        );
        let discovery = node(
            Some(&root),
            Some("Discovery"),
            "Which orbiter flew 39 missions?",
            "Discovery",
            &["39 missions"],
        );
        let goddard = node(
            Some(&nasa),
            Some("Goddard"),
            "Which space flight center is named after a rocket pioneer?",
            "Goddard",
            &[],
        );
        tree.accept(root).unwrap();
        tree.accept(nasa).unwrap();
        tree.accept(discovery).unwrap();
        tree.accept(goddard).unwrap();
        tree
    }

    #[test]
    fn test_root_only_is_single_hop() {
        let mut tree = ReasoningTree::new("doc", 3);
        tree.accept(node(None, None, "Which observatory?", "Hubble", &[]))
            .unwrap();
        let c = nested_cumulative(&tree).unwrap();
        assert_eq!(c.question, "Which observatory?");
        assert_eq!(c.hops(), 1);
        assert!(c.verify_round_trip());
    }

    #[test]
    fn test_nested_form() {
        let tree = three_layer_tree();
        let c = nested_cumulative(&tree).unwrap();
        assert_eq!(
            c.question,
            "Which observatory did [the answer to \"Which agency founded in 1958 operates the \
             [the answer to \"Which space flight center is named after a rocket pioneer\"] center\"] \
             deploy from [the answer to \"Which orbiter flew 39 missions\"]?"
        );
        assert_eq!(c.reasoning_chain[0].answer, "Goddard");
        assert_eq!(c.reasoning_chain.last().unwrap().answer, "Hubble");
        assert_eq!(c.tier, CompositeTier::Fallback);
        assert!(c.verify_round_trip());
        assert_eq!(c.resolve_nested(), "Which observatory did NASA deploy from Discovery?");
    }

    #[test]
    fn test_overlapping_sibling_left_out_of_chain() {
        let mut tree = ReasoningTree::new("doc", 3);
        let root = node(
            None,
            None,
            "Which camera was installed in the Hubble Space Telescope in 1993?",
            "WFPC2",
            &["Hubble Space", "Space Telescope"],
        );
        let first = node(
            Some(&root),
            Some("Hubble Space"),
            "Which name joins an astronomer to the medium he observed through?",
            "Hubble Space",
            &[],
        );
        let second = node(
            Some(&root),
            Some("Space Telescope"),
            "Which kind of instrument observes from orbit?",
            "Space Telescope",
            &[],
        );
        tree.accept(root).unwrap();
        tree.accept(first.clone()).unwrap();
        // bypass the span check to reach the composite with both siblings
        tree.nodes.push(second.clone());

        let c = nested_cumulative(&tree).unwrap();
        assert_eq!(c.hops(), 2);
        assert_eq!(c.reasoning_chain[0].node_id, second.id);
        assert!(c.reasoning_chain.iter().all(|s| s.node_id != first.id));
        assert!(c.verify_round_trip());
    }

    #[test]
    fn test_missing_reference_fails_round_trip() {
        let mut c = nested_cumulative(&three_layer_tree()).unwrap();
        c.nested_form = c.reasoning_chain.last().unwrap().question.clone();
        assert!(!c.verify_round_trip());
    }

    #[test]
    fn test_empty_tree_has_no_composite() {
        assert!(nested_cumulative(&ReasoningTree::new("doc", 3)).is_none());
    }

    #[tokio::test]
    async fn test_paraphrases_filtered() {
        let mock = MockLlmProvider::new()
            .on(
                "TASK: COMPOSITE_INTEGRATION",
                r#"{"question": "Which observatory was deployed by the agency behind the center named for a rocket pioneer, from the orbiter that flew 39 missions?"}"#,
            )
            .on(
                "TASK: COMPOSITE_AMBIGUOUS",
                r#"{"question": "Which observatory did NASA deploy?"}"#,
            );
        let integrator = CompositeIntegrator::new(
            Some(Arc::new(Brain::with_defaults(Arc::new(mock)))),
            true,
            true,
        );
        let out = integrator.integrate(&three_layer_tree()).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].kind, CompositeKind::LlmIntegrated);
        assert_eq!(out[1].tier, CompositeTier::Production);
        assert!(out[1].verify_round_trip());
    }

    #[tokio::test]
    async fn test_mechanical_only() {
        let out = CompositeIntegrator::mechanical()
            .integrate(&three_layer_tree())
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, CompositeKind::NestedCumulative);
    }
}
