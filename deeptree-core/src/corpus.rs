//! Document batches.
//!
//! A batch file is either `{"documents": [...]}` or a bare JSON array of
//! documents.

use crate::error::{ConfigError, DeepTreeError};
use crate::model::{AnswerType, Document};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

#[derive(Deserialize)]
#[serde(untagged)]
enum Batch {
    Wrapped { documents: Vec<Document> },
    Bare(Vec<Document>),
}

/// Parse a batch from JSON text.
pub fn parse_documents(json: &str) -> Result<Vec<Document>, DeepTreeError> {
    let batch: Batch = serde_json::from_str(json)?;
    let documents = match batch {
        Batch::Wrapped { documents } | Batch::Bare(documents) => documents,
    };

    let mut seen = HashSet::new();
    for doc in &documents {
        if doc.id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "document with empty id".into(),
            }
            .into());
        }
        if !seen.insert(doc.id.as_str()) {
            return Err(ConfigError::Invalid {
                message: format!("duplicate document id '{}'", doc.id),
            }
            .into());
        }
        if doc.short_answers.is_empty() {
            warn!(document_id = %doc.id, "Document has no short answers");
        }
    }
    Ok(documents.into_iter().map(infer_answer_types).collect())
}

/// Read and parse a batch file.
pub fn load_documents(path: &Path) -> Result<Vec<Document>, DeepTreeError> {
    let json = std::fs::read_to_string(path)?;
    let documents = parse_documents(&json)?;
    info!(path = %path.display(), count = documents.len(), "Loaded documents");
    Ok(documents)
}

// answers left as `other` get a type guessed from their text
fn infer_answer_types(mut doc: Document) -> Document {
    for answer in &mut doc.short_answers {
        if answer.answer_type == AnswerType::Other {
            answer.answer_type = AnswerType::infer(&answer.text);
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wrapped_batch() {
        let docs = parse_documents(
            r#"{"documents": [{"id": "d1", "title": "Hubble", "text": "Hubble launched in 1990.",
                "short_answers": [{"text": "1990", "answer_type": "other"}]}]}"#,
        )
        .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].short_answers[0].answer_type, AnswerType::Date);
        assert_eq!(docs[0].short_answers[0].confidence, 1.0);
    }

    #[test]
    fn test_bare_array() {
        let docs = parse_documents(r#"[{"id": "a", "text": "x"}, {"id": "b", "text": "y"}]"#).unwrap();
        assert_eq!(docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(docs[0].short_answers.is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = parse_documents(r#"[{"id": "a", "text": "x"}, {"id": "a", "text": "y"}]"#)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("docs.json");
        std::fs::write(&path, r#"[{"id": "a", "text": "x"}]"#).unwrap();
        assert_eq!(load_documents(&path).unwrap().len(), 1);
        assert!(load_documents(&dir.path().join("missing.json")).is_err());
    }
}
