//! Record sources: CSV files, JSON record files and ingestion payloads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use kgforge_core::identifier::sanitize;
use kgforge_core::{Payload, Record};

use crate::config::CsvOptions;
use crate::error::{IngestError, Result};

/// Records as read from a source.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordSet {
    /// Flat rows; every node kind may be synthesized from every row.
    Rows(Vec<Record>),
    /// Records already grouped by node label.
    Partitioned(BTreeMap<String, Vec<Record>>),
}

impl RecordSet {
    pub fn len(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Partitioned(parts) => parts.values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, partitions flattened in label order.
    pub fn records(&self) -> Box<dyn Iterator<Item = &Record> + '_> {
        match self {
            Self::Rows(rows) => Box::new(rows.iter()),
            Self::Partitioned(parts) => Box::new(parts.values().flatten()),
        }
    }

    /// Split into passes of at most `size` rows, each tagged with the index
    /// of its first row. Partitioned sets are always a single pass.
    pub fn into_chunks(self, size: Option<usize>) -> Vec<(usize, RecordSet)> {
        match (self, size) {
            (Self::Rows(rows), Some(size)) if size > 0 && rows.len() > size => rows
                .chunks(size)
                .enumerate()
                .map(|(i, chunk)| (i * size, Self::Rows(chunk.to_vec())))
                .collect(),
            (set, _) => vec![(0, set)],
        }
    }
}

/// Anything that can produce a [`RecordSet`].
pub trait RecordSource {
    /// Short description for logs and run reports.
    fn describe(&self) -> String;

    fn read(&self) -> Result<RecordSet>;
}

/// A delimited text file with a header row. Every value is read as a string.
pub struct CsvSource {
    path: PathBuf,
    options: CsvOptions,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>, options: CsvOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }
}

impl RecordSource for CsvSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    fn read(&self) -> Result<RecordSet> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.options.delimiter_byte()?)
            .flexible(true)
            .from_path(&self.path)?;

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| {
                if self.options.sanitize_headers {
                    sanitize(h)
                } else {
                    h.trim().to_string()
                }
            })
            .collect();

        let limit = self.options.limit.unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        for row in reader.records().take(limit) {
            let row = row?;
            let record: Record = headers
                .iter()
                .zip(row.iter())
                .map(|(header, value)| (header.clone(), Value::String(value.to_string())))
                .collect();
            rows.push(record);
        }

        tracing::info!(
            path = %self.path.display(),
            columns = headers.len(),
            rows = rows.len(),
            "CSV records read"
        );
        Ok(RecordSet::Rows(rows))
    }
}

/// A JSON file holding either an array of objects or an object mapping
/// each label to an array of objects.
pub struct JsonSource {
    path: PathBuf,
    limit: Option<usize>,
}

impl JsonSource {
    pub fn new(path: impl Into<PathBuf>, limit: Option<usize>) -> Self {
        Self {
            path: path.into(),
            limit,
        }
    }

    fn records_from(&self, value: Value) -> Result<RecordSet> {
        let limit = self.limit.unwrap_or(usize::MAX);
        match value {
            Value::Array(items) => {
                let rows = items
                    .into_iter()
                    .take(limit)
                    .map(|item| self.to_record(item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(RecordSet::Rows(rows))
            }
            Value::Object(map) => {
                let mut parts = BTreeMap::new();
                for (label, items) in map {
                    let Value::Array(items) = items else {
                        return Err(self.layout(format!("value of {label:?} is not an array")));
                    };
                    let records = items
                        .into_iter()
                        .take(limit)
                        .map(|item| self.to_record(item))
                        .collect::<Result<Vec<_>>>()?;
                    parts.insert(label, records);
                }
                Ok(RecordSet::Partitioned(parts))
            }
            _ => Err(self.layout("expected an array or an object at the top level".into())),
        }
    }

    fn to_record(&self, item: Value) -> Result<Record> {
        match item {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(self.layout(format!("record is not an object: {other}"))),
        }
    }

    fn layout(&self, reason: String) -> IngestError {
        IngestError::Layout {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

impl RecordSource for JsonSource {
    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }

    fn read(&self) -> Result<RecordSet> {
        let text = std::fs::read_to_string(&self.path)?;
        let set = self.records_from(serde_json::from_str(&text)?)?;
        tracing::info!(path = %self.path.display(), records = set.len(), "JSON records read");
        Ok(set)
    }
}

/// How to interpret an input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum InputFormat {
    /// Decide from the extension and, for JSON, the document shape.
    #[default]
    Auto,
    Csv,
    Json,
    Payload,
}

/// What the pipeline ingests.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Records(RecordSet),
    Payload(Payload),
}

/// Read `path` as `format`, returning the input and its description.
pub fn open(path: &Path, format: InputFormat, options: &CsvOptions) -> Result<(String, Input)> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match format {
        InputFormat::Csv => read_csv(path, options),
        InputFormat::Payload => read_payload(path),
        InputFormat::Json => {
            let source = JsonSource::new(path, options.limit);
            Ok((source.describe(), Input::Records(source.read()?)))
        }
        InputFormat::Auto => match extension.as_deref() {
            Some("csv") | Some("tsv") | Some("txt") => read_csv(path, options),
            _ => {
                let text = std::fs::read_to_string(path)?;
                let value: Value = serde_json::from_str(&text)?;
                if looks_like_payload(&value) {
                    let payload: Payload = serde_json::from_value(value)?;
                    Ok((format!("payload:{}", path.display()), Input::Payload(payload)))
                } else {
                    let source = JsonSource::new(path, options.limit);
                    Ok((source.describe(), Input::Records(source.records_from(value)?)))
                }
            }
        },
    }
}

fn read_csv(path: &Path, options: &CsvOptions) -> Result<(String, Input)> {
    let source = CsvSource::new(path, options.clone());
    Ok((source.describe(), Input::Records(source.read()?)))
}

fn read_payload(path: &Path) -> Result<(String, Input)> {
    let payload = Payload::from_path(path)?;
    tracing::info!(
        path = %path.display(),
        nodes = payload.nodes.len(),
        relationships = payload.relationships.len(),
        "Payload read"
    );
    Ok((format!("payload:{}", path.display()), Input::Payload(payload)))
}

/// A payload is an object whose `nodes` entries carry `labels`.
fn looks_like_payload(value: &Value) -> bool {
    value
        .get("nodes")
        .and_then(Value::as_array)
        .is_some_and(|nodes| nodes.iter().all(|n| n.get("labels").is_some()))
        && value
            .as_object()
            .is_some_and(|map| map.keys().all(|k| k == "nodes" || k == "relationships"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn csv_headers_are_sanitized_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "bgc.csv",
            "Genome,BGC,GC content (%)\nG1,B1,51.2\nG2,,48.0\nG3,B3,50.1\n",
        );

        let options = CsvOptions {
            limit: Some(2),
            ..CsvOptions::default()
        };
        let RecordSet::Rows(rows) = CsvSource::new(&path, options).read().unwrap() else {
            panic!("expected rows");
        };

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["GC_content____"], json!("51.2"));
        assert_eq!(rows[1]["BGC"], json!(""));
    }

    #[test]
    fn csv_headers_can_be_kept_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "x.tsv", "full name\tage\nAlice\t30\n");
        let options = CsvOptions {
            delimiter: "\t".into(),
            sanitize_headers: false,
            limit: None,
        };
        let set = CsvSource::new(&path, options).read().unwrap();
        assert_eq!(set.records().next().unwrap()["full name"], json!("Alice"));
    }

    #[test]
    fn json_arrays_and_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let rows = write_file(&dir, "rows.json", r#"[{"name": "Alice"}, {"name": "Bob"}]"#);
        let parts = write_file(
            &dir,
            "parts.json",
            r#"{"Genome": [{"name": "G1"}, {"name": "G2"}], "BGC": [{"name": "B1"}]}"#,
        );

        let set = JsonSource::new(&rows, Some(1)).read().unwrap();
        assert_eq!(set, RecordSet::Rows(vec![[("name".to_string(), json!("Alice"))].into()]));

        let set = JsonSource::new(&parts, None).read().unwrap();
        let RecordSet::Partitioned(map) = &set else {
            panic!("expected partitions");
        };
        assert_eq!(map["Genome"].len(), 2);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn json_scalars_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad.json", r#"[1, 2]"#);
        assert!(matches!(
            JsonSource::new(&path, None).read(),
            Err(IngestError::Layout { .. })
        ));
    }

    #[test]
    fn auto_detects_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "payload.json",
            r#"{"nodes": [{"id": "n0", "labels": ["Genome"], "properties": {"name": "G1"}}],
                "relationships": []}"#,
        );
        let (source, input) = open(&path, InputFormat::Auto, &CsvOptions::default()).unwrap();
        assert!(source.starts_with("payload:"));
        assert!(matches!(input, Input::Payload(p) if p.nodes.len() == 1));

        let path = write_file(&dir, "people.csv", "name\nAlice\n");
        let (_, input) = open(&path, InputFormat::Auto, &CsvOptions::default()).unwrap();
        assert!(matches!(input, Input::Records(RecordSet::Rows(r)) if r.len() == 1));
    }

    #[test]
    fn rows_split_into_offset_chunks() {
        let rows: Vec<Record> = (0..5)
            .map(|i| [("name".to_string(), json!(format!("p{i}")))].into())
            .collect();
        let chunks = RecordSet::Rows(rows).into_chunks(Some(2));
        let offsets: Vec<usize> = chunks.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![0, 2, 4]);
        assert_eq!(chunks[2].1.len(), 1);

        let single = RecordSet::Partitioned(BTreeMap::new()).into_chunks(Some(2));
        assert_eq!(single.len(), 1);
    }
}
