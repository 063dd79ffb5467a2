//! Run reports: a tamper-evident record of every ingestion run.
//!
//! A report captures what was attempted, what failed and why, and is
//! sealed with a BLAKE3 hash over its content. Reports are stored as JSON
//! files organized by date:
//!
//! ```text
//! {root}/
//!   2026/
//!     10/
//!       19/
//!         {run_id}.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kgforge_core::{ConstraintError, ItemError, SkippedRecord, UpsertResult};
use kgforge_graph::{GraphCounts, PropertyJoin};

/// Unique identifier for an ingestion run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one property join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinOutcome {
    #[serde(rename = "type")]
    pub rel_type: String,
    pub from_label: String,
    pub to_label: String,
    pub linked: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

impl JoinOutcome {
    pub fn linked(join: &PropertyJoin, linked: i64) -> Self {
        Self {
            rel_type: join.rel_type.clone(),
            from_label: join.from_label.clone(),
            to_label: join.to_label.clone(),
            linked,
            error: None,
        }
    }

    pub fn failed(join: &PropertyJoin, error: ItemError) -> Self {
        Self {
            error: Some(error),
            ..Self::linked(join, 0)
        }
    }
}

/// Everything one ingestion run did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub id: RunId,
    /// Where the records came from, e.g. `csv:data/bgc.csv`.
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: UpsertResult,
    pub relationships: UpsertResult,
    /// Records the adapter could not turn into nodes.
    pub skipped: Vec<SkippedRecord>,
    pub constraint_failures: Vec<ConstraintError>,
    pub joins: Vec<JoinOutcome>,
    /// The run stopped early; counts cover only what was dispatched.
    pub cancelled: bool,
    /// Store totals after the run, when they could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counts: Option<GraphCounts>,
    /// BLAKE3 hash of all other fields; set by [`RunReport::finish`].
    pub content_hash: Option<String>,
}

#[derive(Serialize)]
struct HashableReport<'a> {
    id: &'a RunId,
    source: &'a str,
    started_at: &'a DateTime<Utc>,
    completed_at: &'a Option<DateTime<Utc>>,
    nodes: &'a UpsertResult,
    relationships: &'a UpsertResult,
    skipped: &'a [SkippedRecord],
    constraint_failures: &'a [ConstraintError],
    joins: &'a [JoinOutcome],
    cancelled: bool,
    counts: &'a Option<GraphCounts>,
}

impl RunReport {
    pub fn start(source: impl Into<String>) -> Self {
        Self {
            id: RunId::new(),
            source: source.into(),
            started_at: Utc::now(),
            completed_at: None,
            nodes: UpsertResult::default(),
            relationships: UpsertResult::default(),
            skipped: Vec::new(),
            constraint_failures: Vec::new(),
            joins: Vec::new(),
            cancelled: false,
            counts: None,
            content_hash: None,
        }
    }

    /// Stamp the completion time and seal the content hash.
    pub fn finish(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self.content_hash = Some(self.compute_hash());
        self
    }

    pub fn compute_hash(&self) -> String {
        let hashable = HashableReport {
            id: &self.id,
            source: &self.source,
            started_at: &self.started_at,
            completed_at: &self.completed_at,
            nodes: &self.nodes,
            relationships: &self.relationships,
            skipped: &self.skipped,
            constraint_failures: &self.constraint_failures,
            joins: &self.joins,
            cancelled: self.cancelled,
            counts: &self.counts,
        };
        // Serializing plain data into a Vec cannot fail; an empty input still hashes.
        let json = serde_json::to_vec(&hashable).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }

    pub fn verify_integrity(&self) -> bool {
        self.content_hash.as_deref() == Some(self.compute_hash().as_str())
    }

    /// Nothing failed, nothing was skipped, and the run was not cancelled.
    pub fn is_clean(&self) -> bool {
        self.nodes.is_clean()
            && self.relationships.is_clean()
            && self.skipped.is_empty()
            && self.constraint_failures.is_empty()
            && self.joins.iter().all(|j| j.error.is_none())
            && !self.cancelled
    }
}

/// Errors that can occur storing or loading reports.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Run report not found: {0}")]
    NotFound(RunId),

    #[error("Integrity check failed for run {0}: stored hash does not match content")]
    IntegrityViolation(RunId),

    #[error("Run report has no content hash (not finished)")]
    NotFinished,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// File-system report store rooted at `report_dir`.
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ReportError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn report_path(&self, report: &RunReport) -> PathBuf {
        let date = report.started_at.format("%Y/%m/%d");
        self.root.join(format!("{}/{}.json", date, report.id.0))
    }

    /// Write a finished report, returning the file path.
    pub fn save(&self, report: &RunReport) -> Result<PathBuf, ReportError> {
        if report.content_hash.is_none() {
            return Err(ReportError::NotFinished);
        }

        let path = self.report_path(report);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(report)?)?;

        tracing::debug!(run_id = %report.id, path = %path.display(), "Run report saved");
        Ok(path)
    }

    /// Load a report by id, verifying its hash.
    pub fn get(&self, id: RunId) -> Result<RunReport, ReportError> {
        let filename = format!("{}.json", id.0);
        let path = find_file(&self.root, &filename).ok_or(ReportError::NotFound(id))?;
        let report: RunReport = serde_json::from_str(&fs::read_to_string(&path)?)?;

        if !report.verify_integrity() {
            return Err(ReportError::IntegrityViolation(id));
        }
        Ok(report)
    }

    /// All stored reports, newest first.
    pub fn list(&self) -> Result<Vec<RunReport>, ReportError> {
        let mut reports = Vec::new();
        collect_reports(&self.root, &mut reports)?;
        reports.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(reports)
    }
}

fn find_file(dir: &Path, filename: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(filename) {
            return Some(path);
        }
    }
    None
}

fn collect_reports(dir: &Path, out: &mut Vec<RunReport>) -> Result<(), ReportError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_reports(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push(serde_json::from_str(&fs::read_to_string(&path)?)?);
        }
    }
    Ok(())
}
