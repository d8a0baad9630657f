//! Integration tests for verdict ingestion
//!
//! Drives the full pipeline (registration, chain materialization, verdict
//! recording) against an in-memory SQLite database.

use pretty_assertions::assert_eq;
use serde_json::json;

use verdict_store::chain::ChainOutcome;
use verdict_store::config::IngestConfig;
use verdict_store::ingest::{MonitoredPoint, VerdictIngestor, VerdictPayload, VerdictReport};
use verdict_store::registry::{
    BindingRegistration, InstrumentationPointRegistration, PropertyRegistration, Registry,
};
use verdict_store::storage::{
    ChainNodeId, ConditionAtomId, InstrumentationPointId, SqliteStorage, Storage,
};
use verdict_store::StorageError;

const FUNCTION: &str = "app.orders.create";
const PROPERTY: &str = "prop-orders";

/// A store with one registered function, binding, and three instrumented atoms.
struct Fixture {
    storage: SqliteStorage,
    registry: Registry,
    ingestor: VerdictIngestor,
    points: Vec<InstrumentationPointId>,
}

impl Fixture {
    async fn new() -> Self {
        let storage = SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage");
        let registry = Registry::new(storage.clone());

        let property = registry
            .register_property(&PropertyRegistration {
                formula_hash: PROPERTY.to_string(),
                function: FUNCTION.to_string(),
                serialised_formula_structure: json!({"and": [0, 1, 2]}),
                serialised_bind_variables: json!({"q": "calls(db.write)"}),
                serialised_atom_list: vec![
                    (0, "duration(q) < 1".to_string()),
                    (1, "x == 2".to_string()),
                    (2, "y != None".to_string()),
                ],
            })
            .await
            .unwrap();
        let binding = registry
            .register_binding(&BindingRegistration {
                function: property.function,
                binding_space_index: 0,
                binding_statement_lines: json!([10, 11]),
            })
            .await
            .unwrap();

        let mut points = Vec::new();
        for atom in &property.atoms {
            points.push(
                registry
                    .register_instrumentation_point(&InstrumentationPointRegistration {
                        atom: *atom,
                        binding,
                        serialised_condition_sequence: vec![],
                        reaching_path_length: 0,
                    })
                    .await
                    .unwrap(),
            );
        }

        let ingestor = VerdictIngestor::new(
            storage.clone(),
            IngestConfig {
                max_retries: 1,
                retry_delay_ms: 1,
            },
        );

        Self {
            storage,
            registry,
            ingestor,
            points,
        }
    }

    async fn conditions(&self, texts: &[&str]) -> Vec<ConditionAtomId> {
        let mut ids = Vec::new();
        for text in texts {
            ids.push(self.registry.register_condition(text).await.unwrap());
        }
        ids
    }

    /// Payload for the call at `time_of_call` with `(atom_index, path)` points.
    /// The first point collapses the verdict.
    fn payload(&self, time_of_call: &str, points: Vec<(i64, Vec<ConditionAtomId>)>) -> VerdictPayload {
        let collapsing_atom_index = points[0].0;
        VerdictPayload {
            function_name: FUNCTION.to_string(),
            property_hash: PROPERTY.to_string(),
            bind_space_index: 0,
            time_of_call: time_of_call.parse().unwrap(),
            http_request_time: "2024-05-01T09:59:59Z".parse().unwrap(),
            verdict: VerdictReport {
                outcome: false,
                time_obtained: "2024-05-01T10:00:05Z".parse().unwrap(),
                collapsing_atom_index,
                points: points
                    .into_iter()
                    .map(|(atom_index, path)| MonitoredPoint {
                        atom_index,
                        observed_value: json!({"atom": atom_index}),
                        instrumentation_point: self.points[atom_index as usize],
                        path,
                    })
                    .collect(),
            },
        }
    }

    async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(self.storage.pool())
            .await
            .unwrap()
    }
}

const CALL_1: &str = "2024-05-01T10:00:00Z";
const CALL_2: &str = "2024-05-01T10:00:01Z";

#[cfg(test)]
mod chain_scenarios {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_incremental_reports_extend_one_chain() {
        let fx = Fixture::new().await;
        let ids = fx.conditions(&["x", "y", "z"]).await;

        let first = fx
            .ingestor
            .insert(&fx.payload(CALL_1, vec![(0, vec![ids[0]])]))
            .await
            .unwrap();
        assert!(first.new_function_call);
        assert_eq!(first.chain.outcome(), ChainOutcome::Inserted);

        let second = fx
            .ingestor
            .insert(&fx.payload(CALL_1, vec![(1, ids.clone())]))
            .await
            .unwrap();
        assert!(!second.new_function_call);
        assert_eq!(second.function_call, first.function_call);
        assert_eq!(
            second.chain.outcome(),
            ChainOutcome::Extended { splice_depth: 1 }
        );
        assert_eq!(&second.chain.nodes()[..2], first.chain.nodes());

        let chain = fx.storage.load_chain(first.function_call).await.unwrap();
        let atoms: Vec<ConditionAtomId> = chain.iter().map(|n| n.condition_atom).collect();
        assert_eq!(atoms, vec![ConditionAtomId(1), ids[0], ids[1], ids[2]]);
        assert_eq!(chain.iter().filter(|n| n.next.is_terminal()).count(), 1);

        // A still references x, B references z.
        let a = fx.storage.observations_for_verdict(first.verdict).await.unwrap();
        let b = fx.storage.observations_for_verdict(second.verdict).await.unwrap();
        assert_eq!(a[0].chain_node, chain[1].id);
        assert_eq!(b[0].chain_node, chain[3].id);
    }

    #[tokio::test]
    async fn test_prefix_related_points_attach_at_own_depth() {
        let fx = Fixture::new().await;
        let ids = fx.conditions(&["a", "b", "c", "d", "e"]).await;

        let inserted = fx
            .ingestor
            .insert(&fx.payload(
                CALL_1,
                vec![(0, ids[..2].to_vec()), (1, ids.clone()), (2, vec![])],
            ))
            .await
            .unwrap();

        assert_eq!(inserted.chain.nodes().len(), 6);
        assert_eq!(fx.count("path_chain_node").await, 6);

        let observations = fx
            .storage
            .observations_for_verdict(inserted.verdict)
            .await
            .unwrap();
        let nodes: Vec<ChainNodeId> = observations.iter().map(|o| o.chain_node).collect();
        assert_eq!(
            nodes,
            vec![
                inserted.chain.nodes()[2],
                inserted.chain.nodes()[5],
                inserted.chain.nodes()[0],
            ]
        );
        assert_eq!(observations[1].observed_value, json!({"atom": 1}));
    }

    #[tokio::test]
    async fn test_calls_share_conditions_but_not_nodes() {
        let fx = Fixture::new().await;
        let ids = fx.conditions(&["x", "y"]).await;

        let c1 = fx
            .ingestor
            .insert(&fx.payload(CALL_1, vec![(0, ids.clone())]))
            .await
            .unwrap();
        let c2 = fx
            .ingestor
            .insert(&fx.payload(CALL_2, vec![(0, ids.clone())]))
            .await
            .unwrap();

        assert_ne!(c1.function_call, c2.function_call);
        assert_eq!(fx.count("condition_atom").await, 3);

        let mut owned: Vec<ChainNodeId> = c1.chain.nodes()[1..]
            .iter()
            .chain(&c2.chain.nodes()[1..])
            .copied()
            .collect();
        owned.sort();
        owned.dedup();
        assert_eq!(owned.len(), 4);
    }

    #[tokio::test]
    async fn test_matching_resubmission_reuses_nodes() {
        let fx = Fixture::new().await;
        let ids = fx.conditions(&["x", "y"]).await;
        let payload = fx.payload(CALL_1, vec![(0, ids.clone())]);

        let first = fx.ingestor.insert(&payload).await.unwrap();
        let second = fx.ingestor.insert(&payload).await.unwrap();

        assert_eq!(second.chain.outcome(), ChainOutcome::Matched);
        assert_eq!(second.chain.nodes(), first.chain.nodes());
        assert_eq!(fx.count("path_chain_node").await, 3);

        // Verdicts are events: identical outcomes are both kept.
        assert_ne!(first.verdict, second.verdict);
        let verdicts = fx.storage.verdicts_for_call(first.function_call).await.unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].binding_statement_lines, json!([10, 11]));
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_missing_function_writes_nothing() {
        let fx = Fixture::new().await;
        let mut payload = fx.payload(CALL_1, vec![(0, vec![])]);
        payload.function_name = "app.unknown".to_string();

        let err = fx.ingestor.insert(&payload).await.unwrap_err();

        assert!(matches!(
            err,
            StorageError::MissingPrerequisite {
                entity: "function",
                ..
            }
        ));
        assert_eq!(fx.count("http_request").await, 0);
        assert_eq!(fx.count("function_call").await, 0);
    }

    #[tokio::test]
    async fn test_missing_binding_is_reported() {
        let fx = Fixture::new().await;
        let mut payload = fx.payload(CALL_1, vec![(0, vec![])]);
        payload.bind_space_index = 9;

        let err = fx.ingestor.insert(&payload).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::MissingPrerequisite {
                entity: "binding",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_condition_id_writes_nothing() {
        let fx = Fixture::new().await;

        let err = fx
            .ingestor
            .insert(&fx.payload(CALL_1, vec![(0, vec![ConditionAtomId(999)])]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::MissingPrerequisite {
                entity: "condition_atom",
                ..
            }
        ));
        assert_eq!(fx.count("function_call").await, 0);
        assert_eq!(fx.count("path_chain_node").await, 0);
    }

    #[tokio::test]
    async fn test_divergent_report_rolls_back() {
        let fx = Fixture::new().await;
        let ids = fx.conditions(&["x", "y", "z"]).await;

        fx.ingestor
            .insert(&fx.payload(CALL_1, vec![(0, vec![ids[0], ids[1]])]))
            .await
            .unwrap();

        let err = fx
            .ingestor
            .insert(&fx.payload(CALL_1, vec![(0, vec![ids[0], ids[2]])]))
            .await
            .unwrap_err();

        match err {
            StorageError::ChainDivergence { depth, .. } => assert_eq!(depth, 2),
            other => panic!("expected divergence, got {other:?}"),
        }
        assert_eq!(fx.count("verdict").await, 1);
        assert_eq!(fx.count("observation").await, 1);
        assert_eq!(fx.count("path_chain_node").await, 3);
    }

    #[tokio::test]
    async fn test_failed_observation_rolls_back_whole_insertion() {
        let fx = Fixture::new().await;
        let ids = fx.conditions(&["x"]).await;
        let mut payload = fx.payload(CALL_1, vec![(0, ids)]);
        payload.verdict.points[0].instrumentation_point = InstrumentationPointId(999);

        let err = fx.ingestor.insert(&payload).await.unwrap_err();
        assert!(!err.is_transient());

        // Call, chain and verdict were all written before the failing row.
        assert_eq!(fx.count("function_call").await, 0);
        assert_eq!(fx.count("path_chain_node").await, 0);
        assert_eq!(fx.count("verdict").await, 0);
    }

    #[tokio::test]
    async fn test_non_prefix_paths_rejected_before_writes() {
        let fx = Fixture::new().await;
        let ids = fx.conditions(&["x", "y", "z"]).await;

        let err = fx
            .ingestor
            .insert(&fx.payload(
                CALL_1,
                vec![(0, vec![ids[0], ids[1]]), (1, vec![ids[0], ids[2], ids[1]])],
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InvalidPayload { .. }));
        assert_eq!(fx.count("function_call").await, 0);
    }
}
