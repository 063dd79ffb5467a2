//! Configuration for the kgforge loader.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use kgforge_graph::{PropertyJoin, WriterConfig};

use crate::adapter::{IdentitySource, MissingIdentity, RelationshipRule};
use crate::error::{IngestError, Result};

/// Top-level ingestion configuration.
///
/// Loaded from `kgforge.toml` `[ingest]` section or
/// `KGFORGE__INGEST__*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Node property used as the merge identity (default: "name").
    #[serde(default = "default_identity_key")]
    pub identity_key: String,

    /// Where a node's identity value is read from in flat records.
    #[serde(default)]
    pub identity_source: IdentitySource,

    /// What to do with records that carry no identity value.
    #[serde(default)]
    pub missing_identity: MissingIdentity,

    /// Property relationship endpoints are matched on (default: `identity_key`).
    #[serde(default)]
    pub endpoint_key: Option<String>,

    /// Descriptors per write statement; 1 writes items one at a time.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-query deadline in milliseconds.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Maximum node labels written concurrently.
    #[serde(default = "default_max_parallel_labels")]
    pub max_parallel_labels: usize,

    /// Records per pipeline pass. Unset reads the whole input in one pass.
    #[serde(default)]
    pub chunk_size: Option<usize>,

    /// Declare a uniqueness constraint on the identity key for every label.
    #[serde(default = "default_true")]
    pub declare_constraints: bool,

    /// Directory for run reports.
    #[serde(default = "default_report_dir")]
    pub report_dir: String,

    /// Column-presence rules producing relationships.
    #[serde(default)]
    pub rules: Vec<RelationshipRule>,

    /// Property joins run after the relationship phase.
    #[serde(default)]
    pub joins: Vec<PropertyJoin>,

    #[serde(default)]
    pub csv: CsvOptions,
}

/// How CSV input is read.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CsvOptions {
    /// Field delimiter, a single ASCII character.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Rewrite headers into safe identifiers.
    #[serde(default = "default_true")]
    pub sanitize_headers: bool,

    /// Read at most this many rows.
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_identity_key() -> String {
    "name".to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_max_parallel_labels() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_report_dir() -> String {
    "./reports".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            identity_key: default_identity_key(),
            identity_source: IdentitySource::default(),
            missing_identity: MissingIdentity::default(),
            endpoint_key: None,
            batch_size: default_batch_size(),
            query_timeout_ms: default_query_timeout_ms(),
            max_parallel_labels: default_max_parallel_labels(),
            chunk_size: None,
            declare_constraints: true,
            report_dir: default_report_dir(),
            rules: Vec::new(),
            joins: Vec::new(),
            csv: CsvOptions::default(),
        }
    }
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            sanitize_headers: true,
            limit: None,
        }
    }
}

impl IngestConfig {
    /// The writer settings carried by this configuration.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            identity_key: self.identity_key.clone(),
            endpoint_key: self.endpoint_key.clone(),
            batch_size: self.batch_size.max(1),
            query_timeout_ms: self.query_timeout_ms,
        }
    }

    /// Reject settings that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.identity_key.trim().is_empty() {
            return Err(IngestError::Config("identity_key must not be empty".into()));
        }
        if self.max_parallel_labels == 0 {
            return Err(IngestError::Config(
                "max_parallel_labels must be at least 1".into(),
            ));
        }
        if self.chunk_size == Some(0) {
            return Err(IngestError::Config("chunk_size must be at least 1".into()));
        }
        self.csv.delimiter_byte()?;
        Ok(())
    }
}

impl CsvOptions {
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(IngestError::Config(format!(
                "csv.delimiter must be one ASCII character, got {:?}",
                self.delimiter
            ))),
        }
    }
}

/// Read one section of `{file_prefix}.toml` overlaid with `KGFORGE__*`
/// environment variables.
///
/// A missing file or section yields the defaults. A section that is present
/// but does not deserialize is an error.
pub fn load_section<T>(file_prefix: &str, section: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let cfg = ::config::Config::builder()
        .add_source(::config::File::with_name(file_prefix).required(false))
        .add_source(
            ::config::Environment::with_prefix("KGFORGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| IngestError::Config(e.to_string()))?;

    match cfg.get::<T>(section) {
        Ok(value) => Ok(value),
        Err(::config::ConfigError::NotFound(_)) => {
            tracing::debug!(section, "Config section absent, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(IngestError::Config(format!("[{section}]: {e}"))),
    }
}
