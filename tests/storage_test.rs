//! Integration tests for the on-disk SQLite store
//!
//! Covers reopening a database file, and retry behaviour when another
//! connection holds the write lock.

use serde_json::json;
use tempfile::TempDir;

use verdict_store::config::{DatabaseConfig, IngestConfig};
use verdict_store::ingest::{MonitoredPoint, VerdictIngestor, VerdictPayload, VerdictReport};
use verdict_store::registry::{
    BindingRegistration, InstrumentationPointRegistration, PropertyRegistration, Registry,
};
use verdict_store::storage::{SqliteStorage, Storage, ROOT_CONDITION};
use verdict_store::StorageError;

fn database_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("nested").join("verdicts.db"),
        max_connections: 4,
        busy_timeout_ms: 50,
    }
}

/// Register one function with a single instrumented atom and return a
/// payload for it whose only point reported `path_text`.
async fn prepare(storage: &SqliteStorage, path_text: &[&str]) -> VerdictPayload {
    let registry = Registry::new(storage.clone());
    let property = registry
        .register_property(&PropertyRegistration {
            formula_hash: "h-disk".to_string(),
            function: "app.jobs.run".to_string(),
            serialised_formula_structure: json!({}),
            serialised_bind_variables: json!({}),
            serialised_atom_list: vec![(0, "ok".to_string())],
        })
        .await
        .unwrap();
    let binding = registry
        .register_binding(&BindingRegistration {
            function: property.function,
            binding_space_index: 0,
            binding_statement_lines: json!([]),
        })
        .await
        .unwrap();
    let point = registry
        .register_instrumentation_point(&InstrumentationPointRegistration {
            atom: property.atoms[0],
            binding,
            serialised_condition_sequence: vec![],
            reaching_path_length: path_text.len() as i64,
        })
        .await
        .unwrap();

    let mut path = Vec::new();
    for text in path_text {
        path.push(registry.register_condition(text).await.unwrap());
    }

    VerdictPayload {
        function_name: "app.jobs.run".to_string(),
        property_hash: "h-disk".to_string(),
        bind_space_index: 0,
        time_of_call: "2024-06-01T08:00:00.125Z".parse().unwrap(),
        http_request_time: "2024-06-01T08:00:00Z".parse().unwrap(),
        verdict: VerdictReport {
            outcome: true,
            time_obtained: "2024-06-01T08:00:01Z".parse().unwrap(),
            collapsing_atom_index: 0,
            points: vec![MonitoredPoint {
                atom_index: 0,
                observed_value: json!("done"),
                instrumentation_point: point,
                path,
            }],
        },
    }
}

#[tokio::test]
async fn test_database_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = database_config(&dir);

    let (call, nodes) = {
        let storage = SqliteStorage::new(&config).await.unwrap();
        let payload = prepare(&storage, &["a", "b"]).await;
        let ingestor = VerdictIngestor::new(storage.clone(), IngestConfig::default());
        let inserted = ingestor.insert(&payload).await.unwrap();
        storage.pool().close().await;
        (inserted.function_call, inserted.chain.nodes().to_vec())
    };

    let storage = SqliteStorage::new(&config).await.unwrap();

    let chain = storage.load_chain(call).await.unwrap();
    let ids: Vec<_> = chain.iter().map(|n| n.id).collect();
    assert_eq!(ids, nodes);
    assert_eq!(chain[0].condition_atom, ROOT_CONDITION);

    let record = storage.get_function_call(call).await.unwrap().unwrap();
    assert_eq!(
        record.time_of_call,
        "2024-06-01T08:00:00.125Z"
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap()
    );

    // Migrations re-ran without reseeding the root condition.
    let roots: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM condition_atom WHERE serialised_condition = ''")
            .fetch_one(storage.pool())
            .await
            .unwrap();
    assert_eq!(roots, 1);
}

#[tokio::test]
async fn test_locked_database_is_retried_then_unavailable() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::new(&database_config(&dir)).await.unwrap();
    let payload = prepare(&storage, &["a"]).await;
    let ingestor = VerdictIngestor::new(
        storage.clone(),
        IngestConfig {
            max_retries: 2,
            retry_delay_ms: 5,
        },
    );

    // Hold the write lock from another connection.
    let mut blocker = storage.pool().begin().await.unwrap();
    sqlx::query("INSERT INTO http_request (time_of_request, grouping) VALUES ('held', '')")
        .execute(&mut *blocker)
        .await
        .unwrap();

    let err = ingestor.insert(&payload).await.unwrap_err();
    match err {
        StorageError::Unavailable { retries, .. } => assert_eq!(retries, 2),
        other => panic!("expected unavailable, got {other:?}"),
    }

    blocker.rollback().await.unwrap();

    let inserted = ingestor.insert(&payload).await.unwrap();
    assert!(inserted.new_function_call);
    let calls: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM function_call")
        .fetch_one(storage.pool())
        .await
        .unwrap();
    assert_eq!(calls, 1);
}
