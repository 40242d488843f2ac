//! Batch upsert integration tests

mod common;

use common::{init_test_tracing, TestPostgres, KEYED_VARIANTS_DDL};
use serde_json::{json, Value};
use varbulk_common::TableName;
use varbulk_pipeline::{BatchUpserter, Record, UpsertError};

async fn setup() -> TestPostgres {
    init_test_tracing();
    let pg = TestPostgres::start()
        .await
        .expect("Failed to start PostgreSQL container");
    pg.execute(KEYED_VARIANTS_DDL).await.unwrap();
    pg
}

fn keyed() -> TableName {
    TableName::parse("keyed_variants").unwrap()
}

fn records(values: Vec<Value>) -> Vec<Record> {
    values
        .into_iter()
        .map(|v| match v {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        })
        .collect()
}

fn sample(n: i64) -> Vec<Record> {
    records(
        (1..=n)
            .map(|id| {
                json!({
                    "id": id,
                    "gene_symbol": format!("GENE{id}"),
                    "clinical_significance": if id % 2 == 0 { json!("Benign") } else { Value::Null },
                })
            })
            .collect(),
    )
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_is_idempotent() {
    let pg = setup().await;
    let mut conn = pg.conn().await.unwrap();
    let upserter = BatchUpserter::new(2);
    let batch = sample(5);

    let first = upserter.upsert(&mut conn, &batch, &keyed()).await.unwrap();
    assert_eq!(first.inserted, 5);
    assert_eq!(first.skipped, 0);
    assert_eq!(first.chunks, 3);
    let after_first = pg.variant_rows("keyed_variants").await.unwrap();

    let second = upserter.upsert(&mut conn, &batch, &keyed()).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 5);

    assert_eq!(pg.variant_rows("keyed_variants").await.unwrap(), after_first);
    assert_eq!(after_first[1].2.as_deref(), Some("Benign"));
    assert_eq!(after_first[0].2, None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_duplicate_key_in_batch_keeps_first() {
    let pg = setup().await;
    let mut conn = pg.conn().await.unwrap();

    let batch = records(vec![
        json!({"id": 1, "gene_symbol": "BRCA1", "clinical_significance": "Pathogenic"}),
        json!({"id": 1, "gene_symbol": "BRCA2", "clinical_significance": "Benign"}),
    ]);

    let summary = BatchUpserter::new(1)
        .upsert(&mut conn, &batch, &keyed())
        .await
        .expect("conflicting key must not error");

    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.chunks, 2);

    let rows = pg.variant_rows("keyed_variants").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.as_deref(), Some("BRCA1"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_existing_rows_untouched() {
    let pg = setup().await;
    pg.execute("INSERT INTO keyed_variants VALUES (2, 'TP53', 'Pathogenic')")
        .await
        .unwrap();
    let mut conn = pg.conn().await.unwrap();

    let summary = BatchUpserter::default()
        .upsert(&mut conn, &sample(3), &keyed())
        .await
        .unwrap();

    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.skipped, 1);
    let rows = pg.variant_rows("keyed_variants").await.unwrap();
    assert_eq!(rows[1], (Some(2), Some("TP53".to_string()), Some("Pathogenic".to_string())));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_string_values_cast_to_column_type() {
    let pg = setup().await;
    let mut conn = pg.conn().await.unwrap();

    // shape produced by reading a TSV file
    let batch = records(vec![json!({"id": "42", "gene_symbol": "MLH1", "clinical_significance": null})]);
    BatchUpserter::default()
        .upsert(&mut conn, &batch, &keyed())
        .await
        .unwrap();

    let rows = pg.variant_rows("keyed_variants").await.unwrap();
    assert_eq!(rows, vec![(Some(42), Some("MLH1".to_string()), None)]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_invalid_input_touches_nothing() {
    let pg = setup().await;
    let mut conn = pg.conn().await.unwrap();

    let mismatched = records(vec![
        json!({"id": 1, "gene_symbol": "BRCA1"}),
        json!({"id": 2, "rs_id": "rs80357906"}),
    ]);
    let err = BatchUpserter::default()
        .upsert(&mut conn, &mismatched, &keyed())
        .await
        .unwrap_err();
    assert!(matches!(err, UpsertError::MismatchedColumns { index: 1, .. }));

    let unknown = records(vec![json!({"id": 1, "rs_id": "rs80357906"})]);
    let err = BatchUpserter::default()
        .upsert(&mut conn, &unknown, &keyed())
        .await
        .unwrap_err();
    assert!(matches!(err, UpsertError::UnknownColumn { ref column, .. } if column == "rs_id"));

    let err = BatchUpserter::default()
        .upsert(&mut conn, &sample(1), &TableName::parse("missing").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, UpsertError::TableNotFound(_)));

    assert_eq!(pg.count("keyed_variants").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failing_chunk_rolls_back_call() {
    let pg = setup().await;
    let mut conn = pg.conn().await.unwrap();

    let mut batch = sample(4);
    batch[3].insert("id".to_string(), json!("not-a-number"));

    let err = BatchUpserter::new(2)
        .upsert(&mut conn, &batch, &keyed())
        .await
        .unwrap_err();
    assert!(matches!(err, UpsertError::Database(_)));
    assert_eq!(pg.count("keyed_variants").await.unwrap(), 0);
}
