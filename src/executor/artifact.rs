//! Result artifacts written by the host's runner.
//!
//! A run leaves `<stem>.json` (the result document) and/or
//! `<stem>.summary.txt` in the results directory. The executor snapshots the
//! newest artifact before invoking the capability and treats any different
//! newest artifact as the run's output.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use thiserror::Error;

use crate::request::{ItemOutcome, NewResultItem, Summary};

pub const DOCUMENT_SUFFIX: &str = ".json";
pub const SUMMARY_SUFFIX: &str = ".summary.txt";

/// Durations closer than this are the same measurement, rounded differently.
pub const DURATION_TOLERANCE_SECS: f64 = 0.01;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed result document {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: missing '{field}'")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("{path}: bad value for '{field}': {value:?}")]
    BadValue {
        path: PathBuf,
        field: &'static str,
        value: String,
    },

    #[error("summary and result document disagree: summary {summary:?}, document {document:?}")]
    Conflict { summary: Summary, document: Summary },

    #[error("no result files for artifact {stem}")]
    Missing { stem: String },
}

/// Identity of an artifact file at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStamp {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl ArtifactStamp {
    pub fn stem(&self) -> Option<&str> {
        artifact_stem(&self.path)
    }
}

/// The files belonging to one artifact stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub stem: String,
    pub document: Option<PathBuf>,
    pub summary: Option<PathBuf>,
}

impl ArtifactSet {
    /// Locate both companions of the artifact at `path`.
    pub fn for_path(path: &Path) -> Option<Self> {
        let stem = artifact_stem(path)?.to_string();
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let document = dir.join(format!("{stem}{DOCUMENT_SUFFIX}"));
        let summary = dir.join(format!("{stem}{SUMMARY_SUFFIX}"));
        Some(Self {
            stem,
            document: document.is_file().then_some(document),
            summary: summary.is_file().then_some(summary),
        })
    }
}

/// A fully parsed artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArtifact {
    pub summary: Summary,
    pub items: Vec<NewResultItem>,
}

fn artifact_stem(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    // check the longer suffix first: "x.summary.txt" is not a document
    name.strip_suffix(SUMMARY_SUFFIX)
        .or_else(|| name.strip_suffix(DOCUMENT_SUFFIX))
        .filter(|stem| !stem.is_empty())
}

/// Newest artifact in `dir` by modification time; `None` if the directory is
/// missing or holds no artifacts.
pub fn newest_artifact(dir: &Path) -> io::Result<Option<ArtifactStamp>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut newest: Option<ArtifactStamp> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if artifact_stem(&path).is_none() {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        let newer = match &newest {
            None => true,
            // tie-break on name so the choice is stable within one mtime tick
            Some(cur) => (modified, &path) > (cur.modified, &cur.path),
        };
        if newer {
            newest = Some(ArtifactStamp { path, modified });
        }
    }
    Ok(newest)
}

#[derive(Debug, Deserialize)]
struct ResultDocument {
    #[serde(alias = "testcasecount")]
    total: Option<u32>,
    passed: Option<u32>,
    failed: Option<u32>,
    #[serde(default)]
    skipped: u32,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    cases: Vec<DocumentCase>,
}

#[derive(Debug, Deserialize)]
struct DocumentCase {
    #[serde(alias = "fullname")]
    name: String,
    result: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stack_trace: Option<String>,
}

pub fn parse_document(path: &Path, raw: &str) -> Result<ParsedArtifact, ArtifactError> {
    let doc: ResultDocument = serde_json::from_str(raw).map_err(|source| ArtifactError::Document {
        path: path.to_path_buf(),
        source,
    })?;

    let mut items = Vec::with_capacity(doc.cases.len());
    for case in doc.cases {
        let outcome: ItemOutcome = case.result.parse().map_err(|_| ArtifactError::BadValue {
            path: path.to_path_buf(),
            field: "result",
            value: case.result.clone(),
        })?;
        items.push(NewResultItem {
            name: case.name,
            outcome,
            duration_secs: case.duration,
            message: case.message.filter(|m| !m.is_empty()),
            stack_trace: case.stack_trace.filter(|s| !s.is_empty()),
        });
    }

    let missing = |field| ArtifactError::MissingField {
        path: path.to_path_buf(),
        field,
    };
    let summary = Summary {
        total: doc.total.ok_or_else(|| missing("total"))?,
        passed: doc.passed.ok_or_else(|| missing("passed"))?,
        failed: doc.failed.ok_or_else(|| missing("failed"))?,
        skipped: doc.skipped,
        duration_secs: doc.duration,
    };
    Ok(ParsedArtifact { summary, items })
}

/// Parse the labeled lines of a `.summary.txt`. Unknown lines are ignored;
/// the first occurrence of a label wins.
pub fn parse_summary_text(path: &Path, raw: &str) -> Result<Summary, ArtifactError> {
    let mut total = None;
    let mut passed = None;
    let mut failed = None;
    let mut skipped = None;
    let mut duration = None;

    for line in raw.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match label.trim().to_ascii_lowercase().as_str() {
            "total" | "total tests" if total.is_none() => {
                total = Some(parse_count(path, "total", value)?)
            }
            "passed" if passed.is_none() => passed = Some(parse_count(path, "passed", value)?),
            "failed" if failed.is_none() => failed = Some(parse_count(path, "failed", value)?),
            "skipped" if skipped.is_none() => {
                skipped = Some(parse_count(path, "skipped", value)?)
            }
            "duration" if duration.is_none() => duration = Some(parse_duration(path, value)?),
            _ => {}
        }
    }

    let missing = |field| ArtifactError::MissingField {
        path: path.to_path_buf(),
        field,
    };
    Ok(Summary {
        total: total.ok_or_else(|| missing("total"))?,
        passed: passed.ok_or_else(|| missing("passed"))?,
        failed: failed.ok_or_else(|| missing("failed"))?,
        skipped: skipped.unwrap_or(0),
        duration_secs: duration.unwrap_or(0.0),
    })
}

fn parse_count(path: &Path, field: &'static str, value: &str) -> Result<u32, ArtifactError> {
    // tolerate decorations after the number, e.g. "3 ✓"
    let number = value.split_whitespace().next().unwrap_or("");
    number.parse().map_err(|_| ArtifactError::BadValue {
        path: path.to_path_buf(),
        field,
        value: value.to_string(),
    })
}

fn parse_duration(path: &Path, value: &str) -> Result<f64, ArtifactError> {
    let trimmed = value.trim();
    let number = trimmed
        .strip_suffix("seconds")
        .or_else(|| trimmed.strip_suffix('s'))
        .unwrap_or(trimmed)
        .trim();
    number
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| ArtifactError::BadValue {
            path: path.to_path_buf(),
            field: "duration",
            value: value.to_string(),
        })
}

fn read(path: &Path) -> Result<String, ArtifactError> {
    fs::read_to_string(path).map_err(|source| ArtifactError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and reconcile both companions of an artifact.
///
/// Summary counters win; the document supplies items. Disagreeing counters
/// mean one of the files belongs to another run.
pub fn parse_artifacts(set: &ArtifactSet) -> Result<ParsedArtifact, ArtifactError> {
    let document = match &set.document {
        Some(path) => Some(parse_document(path, &read(path)?)?),
        None => None,
    };
    let summary = match &set.summary {
        Some(path) => Some(parse_summary_text(path, &read(path)?)?),
        None => None,
    };

    match (summary, document) {
        (Some(summary), Some(document)) => {
            if !summary.agrees_with(&document.summary, DURATION_TOLERANCE_SECS) {
                return Err(ArtifactError::Conflict {
                    summary,
                    document: document.summary,
                });
            }
            Ok(ParsedArtifact {
                summary,
                items: document.items,
            })
        }
        (Some(summary), None) => Ok(ParsedArtifact {
            summary,
            items: Vec::new(),
        }),
        (None, Some(document)) => Ok(document),
        (None, None) => Err(ArtifactError::Missing {
            stem: set.stem.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUMMARY: &str = "\
Host Test Results Summary
==================================================
Generated: 2024-05-01 10:00:00

Results:
  Total: 10
  Passed: 8
  Failed: 1
  Skipped: 1
  Duration: 12.50 seconds
";

    #[test]
    fn test_summary_text_counters() {
        let s = parse_summary_text(Path::new("r.summary.txt"), SUMMARY).unwrap();
        assert_eq!((s.total, s.passed, s.failed, s.skipped), (10, 8, 1, 1));
        assert!((s.duration_secs - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_summary_text_requires_core_counters() {
        let err = parse_summary_text(Path::new("r.summary.txt"), "Total: 3\nPassed: 3\n")
            .unwrap_err();
        assert!(matches!(err, ArtifactError::MissingField { field: "failed", .. }));
    }

    #[test]
    fn test_summary_text_rejects_garbage_count() {
        let err = parse_summary_text(
            Path::new("r.summary.txt"),
            "Total: many\nPassed: 1\nFailed: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::BadValue { field: "total", .. }));
    }

    #[test]
    fn test_duration_suffixes() {
        let p = Path::new("x");
        assert_eq!(parse_duration(p, "3.25s").unwrap(), 3.25);
        assert_eq!(parse_duration(p, "3.25 seconds").unwrap(), 3.25);
        assert_eq!(parse_duration(p, "7").unwrap(), 7.0);
        assert!(parse_duration(p, "-1").is_err());
    }

    #[test]
    fn test_document_with_testcasecount_alias() {
        let raw = r#"{
            "testcasecount": 2, "passed": 1, "failed": 1, "duration": 0.75,
            "cases": [
                {"name": "A.Ok", "result": "Passed", "duration": 0.25},
                {"name": "A.Bad", "result": "Failed", "duration": 0.5,
                 "message": "boom", "stack_trace": "at A.Bad()"}
            ]
        }"#;
        let parsed = parse_document(Path::new("r.json"), raw).unwrap();
        assert_eq!(parsed.summary.total, 2);
        assert_eq!(parsed.summary.skipped, 0);
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[1].outcome, ItemOutcome::Failed);
        assert_eq!(parsed.items[1].stack_trace.as_deref(), Some("at A.Bad()"));
    }

    #[test]
    fn test_stem_grouping() {
        assert_eq!(artifact_stem(Path::new("d/run_1.summary.txt")), Some("run_1"));
        assert_eq!(artifact_stem(Path::new("d/run_1.json")), Some("run_1"));
        assert_eq!(artifact_stem(Path::new("d/run_1.log")), None);
        assert_eq!(artifact_stem(Path::new("d/.json")), None);
    }

    #[test]
    fn test_newest_artifact_in_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(newest_artifact(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn test_newest_artifact_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.log"), "x").unwrap();
        assert!(newest_artifact(dir.path()).unwrap().is_none());

        fs::write(dir.path().join("run.summary.txt"), SUMMARY).unwrap();
        let stamp = newest_artifact(dir.path()).unwrap().unwrap();
        assert_eq!(stamp.stem(), Some("run"));
    }

    #[test]
    fn test_parse_artifacts_prefers_summary_and_keeps_items() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run.summary.txt"), SUMMARY).unwrap();
        fs::write(
            dir.path().join("run.json"),
            r#"{"total": 10, "passed": 8, "failed": 1, "skipped": 1, "duration": 12.504,
                "cases": [{"name": "A.Bad", "result": "Failed", "message": "nope"}]}"#,
        )
        .unwrap();

        let set = ArtifactSet::for_path(&dir.path().join("run.json")).unwrap();
        let parsed = parse_artifacts(&set).unwrap();
        assert_eq!(parsed.summary.duration_secs, 12.5);
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn test_parse_artifacts_conflict() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run.summary.txt"), SUMMARY).unwrap();
        fs::write(
            dir.path().join("run.json"),
            r#"{"total": 10, "passed": 9, "failed": 0, "skipped": 1, "duration": 12.5}"#,
        )
        .unwrap();

        let set = ArtifactSet::for_path(&dir.path().join("run.summary.txt")).unwrap();
        assert!(matches!(
            parse_artifacts(&set),
            Err(ArtifactError::Conflict { .. })
        ));
    }
}
