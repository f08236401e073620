//! Session history consulted by the circular question detector.
//!
//! One `SessionHistory` lives for one run. The orchestrator passes it by
//! `&mut` into `process_document` and it is read by the detector through `&`.
//! Entries are kept in a rolling window so long runs stay bounded.

use crate::model::{AnswerType, QuestionNode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// A recorded question/answer pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node_id: Uuid,
    pub tree_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub question: String,
    pub answer: String,
    pub answer_type: AnswerType,
    pub keywords: Vec<String>,
}

impl HistoryEntry {
    pub fn from_node(tree_id: Uuid, node: &QuestionNode) -> Self {
        Self {
            node_id: node.id,
            tree_id,
            parent_id: node.parent_id,
            question: node.question_text.clone(),
            answer: node.answer.clone(),
            answer_type: node.answer_type,
            keywords: node.keyword_texts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistory {
    entries: VecDeque<HistoryEntry>,
    max_entries: usize,
}

impl SessionHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn record_node(&mut self, tree_id: Uuid, node: &QuestionNode) {
        self.record(HistoryEntry::from_node(tree_id, node));
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Entries belonging to one tree.
    pub fn tree_entries(&self, tree_id: Uuid) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().filter(move |e| e.tree_id == tree_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for SessionHistory {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tree_id: Uuid, q: &str) -> HistoryEntry {
        HistoryEntry {
            node_id: Uuid::new_v4(),
            tree_id,
            parent_id: None,
            question: q.to_string(),
            answer: "x".to_string(),
            answer_type: AnswerType::Other,
            keywords: vec![],
        }
    }

    #[test]
    fn test_rolling_window() {
        let tree = Uuid::new_v4();
        let mut h = SessionHistory::new(2);
        h.record(entry(tree, "a?"));
        h.record(entry(tree, "b?"));
        h.record(entry(tree, "c?"));
        let qs: Vec<&str> = h.entries().map(|e| e.question.as_str()).collect();
        assert_eq!(qs, vec!["b?", "c?"]);
    }

    #[test]
    fn test_tree_entries_filter() {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let mut h = SessionHistory::default();
        h.record(entry(t1, "a?"));
        h.record(entry(t2, "b?"));
        assert_eq!(h.tree_entries(t1).count(), 1);
        assert_eq!(h.len(), 2);
        h.clear();
        assert!(h.is_empty());
    }
}
