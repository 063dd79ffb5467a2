//! End-to-end runs over the BGC demo files against the in-memory graph.

use std::path::PathBuf;
use std::sync::Arc;

use kgforge_core::SchemaModel;
use kgforge_graph::{GraphCounts, MemoryGraph};
use kgforge_ingest::source::{self, Input, InputFormat};
use kgforge_ingest::{GraphAdapter, IngestConfig, Pipeline, ReportStore};

fn demo(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../demos/bgc")
        .join(file)
}

fn demo_config() -> IngestConfig {
    let cfg = config::Config::builder()
        .add_source(config::File::from(demo("kgforge.toml")))
        .build()
        .unwrap();
    cfg.get::<IngestConfig>("ingest").unwrap()
}

fn demo_pipeline(graph: Arc<MemoryGraph>, config: IngestConfig) -> Pipeline {
    let schema = SchemaModel::from_path(&demo("schema.json")).unwrap();
    Pipeline::new(GraphAdapter::from_config(schema, &config), graph, config)
}

fn demo_input(config: &IngestConfig) -> (String, Input) {
    source::open(&demo("sample.csv"), InputFormat::Auto, &config.csv).unwrap()
}

#[test]
fn demo_config_carries_the_bgc_rules() {
    let config = demo_config();
    assert_eq!(config.rules.len(), 3);
    assert_eq!(config.batch_size, 50);
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn csv_run_builds_the_bgc_graph() {
    let graph = Arc::new(MemoryGraph::new());
    let config = demo_config();
    let (source, input) = demo_input(&config);
    let report = demo_pipeline(graph.clone(), config).run(&source, input).await;

    // Row 4 has no product and row 5 no taxonomy.
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.nodes.succeeded, 18);
    assert!(report.nodes.errors.is_empty());
    assert_eq!(report.relationships.succeeded, 13);
    assert!(report.relationships.errors.is_empty());
    assert_eq!(
        report.counts,
        Some(GraphCounts {
            nodes: 14,
            relationships: 13
        })
    );
    assert_eq!(graph.constraints().len(), 4);

    let genome = graph.node("Genome", "name", "GCF_000203835").unwrap();
    assert_eq!(genome.properties["Genome_size"], serde_json::json!("8.67"));
    assert!(graph
        .relationship("PRODUCES", "name", "BGC0000077", "avermectin")
        .is_some());
}

#[tokio::test]
async fn rerunning_the_same_input_changes_nothing() {
    let graph = Arc::new(MemoryGraph::new());
    let config = demo_config();

    let (source, input) = demo_input(&config);
    let first = demo_pipeline(graph.clone(), config.clone())
        .run(&source, input)
        .await;
    let (source, input) = demo_input(&config);
    let second = demo_pipeline(graph.clone(), config).run(&source, input).await;

    assert_eq!(first.counts, second.counts);
    assert_eq!(second.nodes.failed, 0);
    assert_eq!(second.relationships.failed, 0);
    assert!(second.constraint_failures.is_empty());
}

#[tokio::test]
async fn item_at_a_time_matches_batched() {
    let batched = Arc::new(MemoryGraph::new());
    let single = Arc::new(MemoryGraph::new());
    let config = demo_config();

    let (source, input) = demo_input(&config);
    let a = demo_pipeline(batched.clone(), config.clone())
        .run(&source, input)
        .await;

    let config = IngestConfig {
        batch_size: 1,
        chunk_size: Some(2),
        ..config
    };
    let (source, input) = demo_input(&config);
    let b = demo_pipeline(single.clone(), config).run(&source, input).await;

    assert_eq!(a.counts, b.counts);
    assert_eq!(a.nodes.succeeded, b.nodes.succeeded);
    assert_eq!(a.relationships.succeeded, b.relationships.succeeded);
    let skipped = |r: &kgforge_ingest::RunReport| {
        r.skipped
            .iter()
            .map(|s| (s.label.clone(), s.record_index))
            .collect::<Vec<_>>()
    };
    assert_eq!(skipped(&a), skipped(&b));
}

#[tokio::test]
async fn adapted_payload_loads_the_same_graph() {
    let dir = tempfile::tempdir().unwrap();
    let config = demo_config();
    let schema = SchemaModel::from_path(&demo("schema.json")).unwrap();

    let Input::Records(records) = demo_input(&config).1 else {
        panic!("demo csv should read as records");
    };
    let (payload, skipped) = GraphAdapter::from_config(schema, &config).to_payload(&records);
    assert_eq!(skipped.len(), 2);

    let path = dir.path().join("bgc.json");
    payload.write_to(&path).unwrap();

    let (source, input) = source::open(&path, InputFormat::Auto, &config.csv).unwrap();
    assert!(matches!(input, Input::Payload(_)));

    let graph = Arc::new(MemoryGraph::new());
    let report = demo_pipeline(graph.clone(), config).run(&source, input).await;
    assert_eq!(
        report.counts,
        Some(GraphCounts {
            nodes: 14,
            relationships: 13
        })
    );
    assert!(report.relationships.errors.is_empty());
}

#[tokio::test]
async fn stored_report_round_trips_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let graph = Arc::new(MemoryGraph::new());
    let config = demo_config();
    let (source, input) = demo_input(&config);
    let report = demo_pipeline(graph, config).run(&source, input).await;

    let store = ReportStore::new(dir.path()).unwrap();
    store.save(&report).unwrap();
    let loaded = store.get(report.id).unwrap();
    assert_eq!(loaded.nodes.succeeded, report.nodes.succeeded);
    assert!(loaded.verify_integrity());
}
