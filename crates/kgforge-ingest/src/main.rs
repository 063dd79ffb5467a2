//! CLI entry point for the kgforge graph loader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use kgforge_core::SchemaModel;
use kgforge_graph::{queries, GraphClient, GraphConfig, GraphWriter, MemoryGraph, QueryExecutor};

use kgforge_ingest::config::{self, IngestConfig};
use kgforge_ingest::source::{self, Input, InputFormat};
use kgforge_ingest::{GraphAdapter, Pipeline, ReportStore, RunId, RunReport};

#[derive(Parser)]
#[command(name = "kgforge")]
#[command(about = "Load CSV and JSON records into a Neo4j knowledge graph")]
struct Cli {
    /// Config file prefix (default: kgforge).
    #[arg(short, long, default_value = "kgforge", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a record file or payload into the graph.
    Run {
        /// Input file (CSV, JSON records, or an ingestion payload).
        #[arg(short, long)]
        input: PathBuf,

        /// Schema file. Derived from the payload when omitted for payload input.
        #[arg(short, long)]
        schema: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value = "auto")]
        format: InputFormat,

        /// Override the configured write batch size.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Write to an in-memory graph instead of Neo4j.
        #[arg(long)]
        dry_run: bool,

        /// Do not store the run report.
        #[arg(long)]
        no_report: bool,

        /// Exit non-zero unless every record was written.
        #[arg(long)]
        strict: bool,
    },

    /// Convert records into an ingestion payload file without writing to the graph.
    Adapt {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        schema: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, value_enum, default_value = "auto")]
        format: InputFormat,
    },

    /// Declare identity uniqueness constraints for every label in a schema.
    Constraints {
        #[arg(short, long)]
        schema: PathBuf,
    },

    /// Print node and relationship totals.
    Counts,

    /// Read back what the graph holds.
    Inspect {
        #[command(subcommand)]
        target: InspectTarget,
    },

    /// Detach-delete nodes. Without filters this empties the graph.
    Reset {
        /// Only nodes with this label.
        #[arg(long)]
        label: Option<String>,

        /// Only nodes that carry this property.
        #[arg(long)]
        having_property: Option<String>,

        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Stored run reports.
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },
}

#[derive(Subcommand)]
enum InspectTarget {
    /// Property maps of every node with a label.
    Nodes {
        #[arg(short, long)]
        label: String,
    },
    /// Property maps of every relationship of a type.
    Relationships {
        #[arg(short = 't', long = "type")]
        rel_type: String,
    },
    /// Declared constraints, optionally only those on one label.
    Constraints {
        #[arg(short, long)]
        label: Option<String>,
    },
    /// Databases the server exposes.
    Databases,
}

#[derive(Subcommand)]
enum ReportAction {
    /// Print a stored run report after verifying its hash.
    Show {
        /// Run id.
        id: Uuid,
    },
    /// One summary line per stored report, newest first.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut ingest_config: IngestConfig = config::load_section(&cli.config, "ingest")?;

    match cli.command {
        Command::Run {
            input,
            schema,
            format,
            batch_size,
            dry_run,
            no_report,
            strict,
        } => {
            if let Some(size) = batch_size {
                ingest_config.batch_size = size;
            }
            ingest_config.validate()?;
            let report = run(
                &cli.config,
                ingest_config,
                &input,
                schema.as_deref(),
                format,
                dry_run,
                no_report,
            )
            .await?;
            if strict && !report.is_clean() {
                anyhow::bail!(
                    "run {} finished with {} node and {} relationship failure(s), {} skipped record(s)",
                    report.id,
                    report.nodes.failed,
                    report.relationships.failed,
                    report.skipped.len()
                );
            }
        }
        Command::Adapt {
            input,
            schema,
            output,
            format,
        } => {
            ingest_config.validate()?;
            adapt(&ingest_config, &input, &schema, &output, format)?;
        }
        Command::Constraints { schema } => {
            let schema = SchemaModel::from_path(&schema)?;
            let executor = connect(&cli.config).await?;
            let writer = GraphWriter::new(executor, ingest_config.writer_config());
            let failures = writer.declare_constraints(&schema).await;
            println!("{}", serde_json::to_string_pretty(&failures)?);
            if !failures.is_empty() {
                anyhow::bail!("{} constraint declaration(s) failed", failures.len());
            }
        }
        Command::Counts => {
            let executor = connect(&cli.config).await?;
            let counts = queries::counts(executor.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::Inspect { target } => {
            let executor = connect(&cli.config).await?;
            let executor = executor.as_ref();
            let output = match target {
                InspectTarget::Nodes { label } => {
                    serde_json::to_value(queries::node_properties(executor, &label).await?)?
                }
                InspectTarget::Relationships { rel_type } => serde_json::to_value(
                    queries::relationship_properties(executor, &rel_type).await?,
                )?,
                InspectTarget::Constraints { label } => {
                    serde_json::to_value(queries::constraints(executor, label.as_deref()).await?)?
                }
                InspectTarget::Databases => serde_json::to_value(queries::databases(executor).await?)?,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Reset {
            label,
            having_property,
            yes,
        } => {
            if !yes {
                anyhow::bail!("reset deletes nodes and their relationships; pass --yes to proceed");
            }
            let executor = connect(&cli.config).await?;
            let writer = GraphWriter::new(executor, ingest_config.writer_config());
            let deleted = writer
                .delete_nodes(label.as_deref(), having_property.as_deref())
                .await?;
            println!("{}", serde_json::json!({ "deleted": deleted }));
        }
        Command::Report { action } => {
            let store = ReportStore::new(&ingest_config.report_dir)?;
            match action {
                ReportAction::Show { id } => {
                    let report = store.get(RunId(id))?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                ReportAction::List => {
                    for report in store.list()? {
                        let summary = serde_json::json!({
                            "id": report.id,
                            "source": report.source,
                            "started_at": report.started_at,
                            "clean": report.is_clean(),
                            "verified": report.verify_integrity(),
                        });
                        println!("{summary}");
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run(
    config_prefix: &str,
    config: IngestConfig,
    input_path: &Path,
    schema_path: Option<&Path>,
    format: InputFormat,
    dry_run: bool,
    no_report: bool,
) -> anyhow::Result<RunReport> {
    let (source, input) = source::open(input_path, format, &config.csv)?;

    // Schema errors abort before any connection or write.
    let schema = match (schema_path, &input) {
        (Some(path), _) => SchemaModel::from_path(path)?,
        (None, Input::Payload(payload)) => SchemaModel::from_payload(payload)?,
        (None, Input::Records(_)) => anyhow::bail!("--schema is required for record input"),
    };

    let executor: Arc<dyn QueryExecutor> = if dry_run {
        tracing::info!("Dry run: writing to an in-memory graph");
        Arc::new(MemoryGraph::new())
    } else {
        connect(config_prefix).await?
    };

    let report_dir = config.report_dir.clone();
    let adapter = GraphAdapter::from_config(schema, &config);
    let pipeline = Pipeline::new(adapter, executor, config);

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight statements");
            token.cancel();
        }
    });

    let report = pipeline.run(&source, input).await;

    if !no_report {
        let path = ReportStore::new(&report_dir)?.save(&report)?;
        tracing::info!(run_id = %report.id, path = %path.display(), "Run report stored");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report)
}

fn adapt(
    config: &IngestConfig,
    input_path: &Path,
    schema_path: &Path,
    output: &Path,
    format: InputFormat,
) -> anyhow::Result<()> {
    let schema = SchemaModel::from_path(schema_path)?;
    let records = match source::open(input_path, format, &config.csv)?.1 {
        Input::Records(records) => records,
        Input::Payload(_) => anyhow::bail!("{} is already a payload", input_path.display()),
    };

    let adapter = GraphAdapter::from_config(schema, config);
    let (payload, skipped) = adapter.to_payload(&records);
    payload.write_to(output)?;

    tracing::info!(
        output = %output.display(),
        nodes = payload.nodes.len(),
        relationships = payload.relationships.len(),
        skipped = skipped.len(),
        "Payload written"
    );
    Ok(())
}

async fn connect(config_prefix: &str) -> anyhow::Result<Arc<dyn QueryExecutor>> {
    let graph_config: GraphConfig = config::load_section(config_prefix, "neo4j")?;
    let client = GraphClient::connect(&graph_config).await?;
    Ok(Arc::new(client))
}
