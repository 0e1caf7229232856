use std::sync::atomic::Ordering;

use anyhow::Result;

use crate::fixtures::{self, field, harness, plain_fields};
use lodestone_core::crd::{FieldType, ValidationThresholds};

#[tokio::test]
async fn fully_materialized_generation_is_valid() -> Result<()> {
    let h = harness();
    let pipeline = fixtures::test_pipeline("p1", plain_fields(), vec![]);

    h.sync.materialize(&pipeline, "g1").await?;
    let health = h.tracker.evaluate(&pipeline, "g1").await?;

    assert!(health.is_valid(), "expected a valid generation, got: {}", health.summary());
    assert_eq!(health.members.len(), 7, "expected 7 resource set members, got {:?}", health.members);

    Ok(())
}

#[tokio::test]
async fn unmaterialized_generation_reports_every_member_missing() -> Result<()> {
    let h = harness();
    let pipeline = fixtures::test_pipeline("p1", plain_fields(), vec![]);

    let health = h.tracker.evaluate(&pipeline, "g1").await?;

    assert!(!health.is_valid(), "expected an invalid generation");
    assert!(
        health.members.iter().all(|(_, status)| !status.is_healthy()),
        "expected every member unhealthy, got {:?}",
        health.members
    );

    Ok(())
}

#[tokio::test]
async fn a_single_missing_member_blocks_validity() -> Result<()> {
    let h = harness();
    let pipeline = fixtures::test_pipeline("p1", plain_fields(), vec![]);

    h.sync.materialize(&pipeline, "g1").await?;
    h.search.indices.lock().unwrap().clear();
    let health = h.tracker.evaluate(&pipeline, "g1").await?;

    assert!(!health.is_valid(), "expected the missing index to block validity");
    assert!(health.summary().contains("indexpipeline.p1.g1 is missing"), "unexpected summary: {}", health.summary());

    Ok(())
}

#[tokio::test]
async fn a_stopped_connector_blocks_validity() -> Result<()> {
    let h = harness();
    let pipeline = fixtures::test_pipeline("p1", plain_fields(), vec![]);

    h.sync.materialize(&pipeline, "g1").await?;
    h.log.running.store(false, Ordering::SeqCst);
    let health = h.tracker.evaluate(&pipeline, "g1").await?;

    assert!(!health.is_valid(), "expected the stopped connector to block validity");
    assert!(health.summary().contains("pending"), "unexpected summary: {}", health.summary());

    Ok(())
}

#[tokio::test]
async fn json_schema_generations_track_the_ingest_pipeline_member() -> Result<()> {
    let h = harness();
    let fields = vec![field("id", FieldType::String), field("tags", FieldType::Json)];
    let pipeline = fixtures::test_pipeline("p1", fields, vec![]);

    h.sync.materialize(&pipeline, "g1").await?;
    let health = h.tracker.evaluate(&pipeline, "g1").await?;
    assert_eq!(health.members.len(), 8, "expected the ingest pipeline as an extra member, got {:?}", health.members);
    assert!(health.is_valid(), "expected a valid generation, got: {}", health.summary());

    h.search.pipelines.lock().unwrap().clear();
    let health = h.tracker.evaluate(&pipeline, "g1").await?;
    assert!(!health.is_valid(), "expected the missing ingest pipeline to block validity");

    Ok(())
}

#[tokio::test]
async fn validation_thresholds_gate_promotion() -> Result<()> {
    let h = harness();
    let mut pipeline = fixtures::test_pipeline("p1", plain_fields(), vec![]);
    pipeline.spec.validation = Some(ValidationThresholds {
        max_connector_lag: Some(10),
        min_document_count: Some(100),
    });

    h.sync.materialize(&pipeline, "g1").await?;
    *h.log.lag.lock().unwrap() = Some(500);
    *h.search.documents.lock().unwrap() = 7;

    let health = h.tracker.evaluate(&pipeline, "g1").await?;
    assert!(!health.is_valid(), "expected failed gates to block validity");
    assert_eq!(health.gate_failures.len(), 2, "expected both gates to fail, got {:?}", health.gate_failures);
    assert!(health.summary().contains("connector lag 500"), "unexpected summary: {}", health.summary());
    assert!(health.summary().contains("document count 7"), "unexpected summary: {}", health.summary());

    *h.log.lag.lock().unwrap() = Some(3);
    *h.search.documents.lock().unwrap() = 250;
    let health = h.tracker.evaluate(&pipeline, "g1").await?;
    assert!(health.is_valid(), "expected passing gates, got: {}", health.summary());

    Ok(())
}

#[tokio::test]
async fn unreported_lag_does_not_block_promotion() -> Result<()> {
    let h = harness();
    let mut pipeline = fixtures::test_pipeline("p1", plain_fields(), vec![]);
    pipeline.spec.validation = Some(ValidationThresholds { max_connector_lag: Some(10), min_document_count: None });

    h.sync.materialize(&pipeline, "g1").await?;
    let health = h.tracker.evaluate(&pipeline, "g1").await?;

    assert!(health.is_valid(), "expected an unreported lag to be skipped, got: {}", health.summary());

    Ok(())
}
