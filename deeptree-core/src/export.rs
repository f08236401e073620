//! Result artifacts on disk.
//!
//! Per document: `<id>.tree.json` (when a tree exists) and
//! `<id>.trajectory.json`, each written to a `.tmp` sibling and renamed into
//! place. One line per document is appended to `summary.jsonl`.

use crate::orchestrator::DocumentResult;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SUMMARY_FILE: &str = "summary.jsonl";

/// One `summary.jsonl` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryLine {
    pub document_id: String,
    pub tree_id: Option<String>,
    pub nodes: usize,
    pub depth: usize,
    pub composites: usize,
    pub search_calls: usize,
    pub success_rate: f64,
    pub cancelled: bool,
}

impl SummaryLine {
    pub fn from_result(result: &DocumentResult) -> Self {
        let stats = &result.trajectory.stats;
        Self {
            document_id: result.document_id.clone(),
            tree_id: result.tree.as_ref().map(|t| t.tree_id.to_string()),
            nodes: stats.final_size,
            depth: stats.final_depth,
            composites: result.tree.as_ref().map_or(0, |t| t.composites.len()),
            search_calls: stats.total_search_calls,
            success_rate: stats.success_rate,
            cancelled: result.trajectory.cancelled,
        }
    }
}

/// Paths written for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenArtifacts {
    pub tree: Option<PathBuf>,
    pub trajectory: PathBuf,
}

/// Keep ids usable as file names.
fn file_stem(document_id: &str) -> String {
    document_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn write_result(dir: &Path, result: &DocumentResult) -> io::Result<WrittenArtifacts> {
    std::fs::create_dir_all(dir)?;
    let stem = file_stem(&result.document_id);

    let tree = match &result.tree {
        Some(tree) => {
            let path = dir.join(format!("{stem}.tree.json"));
            atomic_write_json(&path, tree)?;
            Some(path)
        }
        None => None,
    };
    let trajectory = dir.join(format!("{stem}.trajectory.json"));
    atomic_write_json(&trajectory, &result.trajectory)?;

    let line = serde_json::to_string(&SummaryLine::from_result(result)).map_err(io::Error::other)?;
    let mut summary = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(SUMMARY_FILE))?;
    writeln!(summary, "{line}")?;

    debug!(document_id = %result.document_id, dir = %dir.display(), "Artifacts written");
    Ok(WrittenArtifacts { tree, trajectory })
}

/// Read back every summary line in `dir`.
pub fn read_summary(dir: &Path) -> io::Result<Vec<SummaryLine>> {
    let path = dir.join(SUMMARY_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    std::fs::read_to_string(path)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReasoningTree;
    use crate::model::tests::node;
    use crate::trajectory::TrajectoryRecorder;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn result(id: &str, with_tree: bool) -> DocumentResult {
        let tree = with_tree.then(|| {
            let mut tree = ReasoningTree::new(id, 3);
            tree.accept(node(None, None, "Which observatory?", "Hubble", &[]))
                .unwrap();
            tree
        });
        let trajectory = TrajectoryRecorder::new(id).finalize(tree.as_ref(), false);
        DocumentResult {
            document_id: id.to_string(),
            tree,
            trajectory,
        }
    }

    #[test]
    fn test_writes_tree_and_trajectory() {
        let dir = TempDir::new().unwrap();
        let written = write_result(dir.path(), &result("doc-1", true)).unwrap();
        let tree_path = written.tree.unwrap();
        assert!(tree_path.ends_with("doc-1.tree.json"));
        let tree: ReasoningTree =
            serde_json::from_str(&std::fs::read_to_string(tree_path).unwrap()).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(written.trajectory.exists());
        assert!(!dir.path().join("doc-1.tree.tmp").exists());
    }

    #[test]
    fn test_summary_appends() {
        let dir = TempDir::new().unwrap();
        write_result(dir.path(), &result("a", true)).unwrap();
        let written = write_result(dir.path(), &result("b/c", false)).unwrap();
        assert!(written.tree.is_none());
        assert!(written.trajectory.ends_with("b_c.trajectory.json"));

        let lines = read_summary(dir.path()).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].nodes, 1);
        assert_eq!(lines[1].document_id, "b/c");
        assert_eq!(lines[1].tree_id, None);
    }
}
