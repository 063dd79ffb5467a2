//! The ingestion pipeline.
//!
//! Declares constraints, writes the nodes of every chunk (independent
//! labels in parallel, bounded by a semaphore), waits for every node task,
//! and only then writes the relationships of every chunk. Property joins
//! run last. A cancellation token stops dispatch at any point; whatever was
//! done is still reported.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use kgforge_core::{ItemError, NodeUpsert, RelationshipUpsert, UpsertResult};
use kgforge_graph::{queries, GraphWriter, QueryExecutor};

use crate::adapter::{GraphAdapter, NodeMapping};
use crate::config::IngestConfig;
use crate::report::{JoinOutcome, RunReport};
use crate::source::Input;

/// Drives one ingestion run against a [`QueryExecutor`].
pub struct Pipeline {
    adapter: Arc<GraphAdapter>,
    writer: GraphWriter,
    executor: Arc<dyn QueryExecutor>,
    config: IngestConfig,
    concurrency: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        adapter: GraphAdapter,
        executor: Arc<dyn QueryExecutor>,
        config: IngestConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let writer = GraphWriter::new(executor.clone(), config.writer_config())
            .with_cancellation(cancel.clone());
        let concurrency = Arc::new(Semaphore::new(config.max_parallel_labels.max(1)));
        Self {
            adapter: Arc::new(adapter),
            writer,
            executor,
            config,
            concurrency,
            cancel,
        }
    }

    /// Observe `token` instead of the pipeline's own.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.writer = self.writer.with_cancellation(token.clone());
        self.cancel = token;
        self
    }

    /// Token that stops the run when cancelled. In-flight statements finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ingest `input`, described as `source` in the report.
    ///
    /// Always returns a finished report; per-item failures are inside it.
    pub async fn run(&self, source: &str, input: Input) -> RunReport {
        let mut report = RunReport::start(source);
        tracing::info!(run_id = %report.id, source, "Ingestion run started");

        if self.config.declare_constraints && !self.cancel.is_cancelled() {
            report.constraint_failures = self.writer.declare_constraints(self.adapter.schema()).await;
        }

        match input {
            Input::Records(records) => {
                let chunks = records.into_chunks(self.config.chunk_size);

                // Every node chunk lands before any relationship is merged, so
                // an endpoint introduced by a later chunk is still found.
                for &(offset, ref chunk) in &chunks {
                    tracing::info!(offset, records = chunk.len(), "Writing node chunk");
                    let mut mapping = self.adapter.map_nodes(chunk);
                    for skipped in &mut mapping.skipped {
                        skipped.record_index += offset;
                    }
                    self.write_nodes(&mut report, mapping).await;
                }
                for &(offset, ref chunk) in &chunks {
                    tracing::info!(offset, records = chunk.len(), "Writing relationship chunk");
                    let relationships = self.adapter.map_relationships(chunk);
                    self.write_relationships(&mut report, &relationships).await;
                }
            }
            Input::Payload(payload) => {
                let mapping = self.adapter.map_payload(&payload);
                self.write_nodes(&mut report, mapping.nodes).await;
                self.write_relationships(&mut report, &mapping.relationships)
                    .await;
            }
        }

        for join in &self.config.joins {
            if self.cancel.is_cancelled() {
                break;
            }
            let outcome = match self.writer.link_by_property(join).await {
                Ok(linked) => JoinOutcome::linked(join, linked),
                Err(e) => {
                    tracing::warn!(rel_type = %join.rel_type, error = %e, "Property join failed");
                    JoinOutcome::failed(join, e)
                }
            };
            report.joins.push(outcome);
        }

        report.cancelled = self.cancel.is_cancelled();
        if !report.cancelled {
            match queries::counts(self.executor.as_ref()).await {
                Ok(counts) => report.counts = Some(counts),
                Err(e) => tracing::warn!(error = %e, "Could not read graph counts"),
            }
        }

        let report = report.finish();
        tracing::info!(
            run_id = %report.id,
            nodes_succeeded = report.nodes.succeeded,
            nodes_failed = report.nodes.failed,
            relationships_succeeded = report.relationships.succeeded,
            relationships_failed = report.relationships.failed,
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Ingestion run complete"
        );
        report
    }

    /// Node phase for one chunk. Failure indices are shifted into the
    /// run-wide descriptor sequence.
    async fn write_nodes(&self, report: &mut RunReport, mapping: NodeMapping) {
        report.skipped.extend(mapping.skipped);

        let base = report.nodes.attempted + report.nodes.not_dispatched;
        let nodes = self.upsert_nodes_by_label(mapping.nodes).await;
        let positions = nodes.positions(base);
        report.nodes.absorb(nodes.result, &positions);
    }

    async fn write_relationships(
        &self,
        report: &mut RunReport,
        relationships: &[RelationshipUpsert],
    ) {
        let base = report.relationships.attempted + report.relationships.not_dispatched;
        let result = self.writer.upsert_relationships(relationships).await;
        let positions: Vec<usize> = (base..base + relationships.len()).collect();
        report.relationships.absorb(result, &positions);
    }

    /// Upsert each label's nodes as its own task, then wait for all of them.
    async fn upsert_nodes_by_label(&self, nodes: Vec<NodeUpsert>) -> LabelledResult {
        let count = nodes.len();
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            match groups.iter_mut().find(|(label, _)| *label == node.label) {
                Some((_, members)) => members.push(index),
                None => groups.push((node.label.clone(), vec![index])),
            }
        }

        let mut handles = Vec::new();
        for (label, members) in groups {
            let batch: Vec<NodeUpsert> = members.iter().map(|&i| nodes[i].clone()).collect();
            let writer = self.writer.clone();
            let semaphore = self.concurrency.clone();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return UpsertResult {
                        not_dispatched: batch.len(),
                        ..UpsertResult::default()
                    };
                };
                tracing::debug!(label = %label, nodes = batch.len(), "Label task started");
                writer.upsert_nodes(&batch).await
            });
            handles.push((members, handle));
        }

        let mut result = UpsertResult::default();
        for (members, handle) in handles {
            match handle.await {
                Ok(label_result) => result.absorb(label_result, &members),
                Err(e) => {
                    tracing::error!(error = %e, "Node upsert task panicked");
                    for &index in &members {
                        result.record_failure(
                            index,
                            nodes[index].describe(),
                            ItemError::Query {
                                message: format!("node task aborted: {e}"),
                            },
                        );
                    }
                    result.errors.sort_by_key(|f| f.index);
                }
            }
        }

        LabelledResult { result, count }
    }
}

struct LabelledResult {
    result: UpsertResult,
    count: usize,
}

impl LabelledResult {
    fn positions(&self, base: usize) -> Vec<usize> {
        (base..base + self.count).collect()
    }
}
