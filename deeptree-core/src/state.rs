//! Per-candidate lifecycle state machine.
//!
//! A child candidate walks
//! `Candidate -> KeywordExtracted -> MaskValidated -> CircularChecked ->
//! SearchSynthesized -> QuestionGenerated -> DualValidated -> Accepted`.
//! Root candidates take `Candidate -> QuestionGenerated -> DualValidated ->
//! Accepted`. `Rejected` is reachable from every non-terminal state, and a
//! failed generation or validation may loop back to `QuestionGenerated` for a
//! bounded regeneration.

use crate::error::TreeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Candidate,
    /// The parent keyword came from the parent's extracted set.
    KeywordExtracted,
    /// The parent keyword survived the parent's masking tests.
    MaskValidated,
    CircularChecked,
    SearchSynthesized,
    QuestionGenerated,
    DualValidated,
    Accepted,
    Rejected,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Accepted | NodeState::Rejected)
    }

    fn successors(self, is_root: bool) -> &'static [NodeState] {
        use NodeState::*;
        match (self, is_root) {
            (Candidate, true) => &[QuestionGenerated, Rejected],
            (Candidate, false) => &[KeywordExtracted, Rejected],
            (KeywordExtracted, false) => &[MaskValidated, Rejected],
            (MaskValidated, false) => &[CircularChecked, Rejected],
            (CircularChecked, false) => &[SearchSynthesized, Rejected],
            (SearchSynthesized, false) => &[QuestionGenerated, Rejected],
            (QuestionGenerated, _) => &[DualValidated, QuestionGenerated, Rejected],
            (DualValidated, _) => &[Accepted, QuestionGenerated, Rejected],
            _ => &[],
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Candidate => "candidate",
            NodeState::KeywordExtracted => "keyword_extracted",
            NodeState::MaskValidated => "mask_validated",
            NodeState::CircularChecked => "circular_checked",
            NodeState::SearchSynthesized => "search_synthesized",
            NodeState::QuestionGenerated => "question_generated",
            NodeState::DualValidated => "dual_validated",
            NodeState::Accepted => "accepted",
            NodeState::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of one candidate node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLifecycle {
    pub candidate_id: Uuid,
    pub is_root: bool,
    state: NodeState,
    history: Vec<(NodeState, DateTime<Utc>)>,
    pub rejection_reason: Option<String>,
}

impl NodeLifecycle {
    pub fn root() -> Self {
        Self::new(true)
    }

    pub fn child() -> Self {
        Self::new(false)
    }

    fn new(is_root: bool) -> Self {
        Self {
            candidate_id: Uuid::new_v4(),
            is_root,
            state: NodeState::Candidate,
            history: vec![(NodeState::Candidate, Utc::now())],
            rejection_reason: None,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// States visited so far, in order.
    pub fn visited(&self) -> Vec<NodeState> {
        self.history.iter().map(|(s, _)| *s).collect()
    }

    pub fn can_transition(&self, to: NodeState) -> bool {
        self.state.successors(self.is_root).contains(&to)
    }

    /// Move to `to`, rejecting moves the lifecycle does not allow.
    pub fn transition(&mut self, to: NodeState) -> Result<(), TreeError> {
        if !self.can_transition(to) {
            return Err(TreeError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.history.push((to, Utc::now()));
        Ok(())
    }

    /// Terminal rejection with a reason.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), TreeError> {
        self.transition(NodeState::Rejected)?;
        self.rejection_reason = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeState::*;

    #[test]
    fn test_child_full_path() {
        let mut lc = NodeLifecycle::child();
        for s in [
            KeywordExtracted,
            MaskValidated,
            CircularChecked,
            SearchSynthesized,
            QuestionGenerated,
            DualValidated,
            Accepted,
        ] {
            lc.transition(s).unwrap();
        }
        assert!(lc.state().is_terminal());
        assert_eq!(lc.visited().len(), 8);
    }

    #[test]
    fn test_root_shortened_path() {
        let mut lc = NodeLifecycle::root();
        lc.transition(QuestionGenerated).unwrap();
        lc.transition(DualValidated).unwrap();
        lc.transition(Accepted).unwrap();
        assert_eq!(lc.state(), Accepted);
    }

    #[test]
    fn test_root_cannot_take_child_states() {
        let mut lc = NodeLifecycle::root();
        let err = lc.transition(KeywordExtracted).unwrap_err();
        assert_eq!(
            err,
            TreeError::InvalidStateTransition {
                from: "candidate".into(),
                to: "keyword_extracted".into()
            }
        );
    }

    #[test]
    fn test_skipping_states_rejected() {
        let mut lc = NodeLifecycle::child();
        assert!(lc.transition(SearchSynthesized).is_err());
        lc.transition(KeywordExtracted).unwrap();
        assert!(lc.transition(Accepted).is_err());
    }

    #[test]
    fn test_reject_from_any_non_terminal() {
        let mut lc = NodeLifecycle::child();
        lc.transition(KeywordExtracted).unwrap();
        lc.transition(MaskValidated).unwrap();
        lc.reject("critical circular risk").unwrap();
        assert_eq!(lc.state(), Rejected);
        assert_eq!(lc.rejection_reason.as_deref(), Some("critical circular risk"));
        // terminal
        assert!(lc.reject("again").is_err());
        assert!(lc.transition(Candidate).is_err());
    }

    #[test]
    fn test_regeneration_loop() {
        let mut lc = NodeLifecycle::root();
        lc.transition(QuestionGenerated).unwrap();
        lc.transition(QuestionGenerated).unwrap();
        lc.transition(DualValidated).unwrap();
        lc.transition(QuestionGenerated).unwrap();
        lc.transition(DualValidated).unwrap();
        lc.transition(Accepted).unwrap();
    }
}
