//! The schema-registry adapter: Avro value schema and GraphQL artifacts.

use std::sync::Arc;

use crate::backends::{ArtifactMeta, HealthStatus, RegistryApi};
use crate::names::NameSet;
use lodestone_core::schema::ValueSchema;
use lodestone_core::{ReconcileError, ReconcileResult};

/// The lifecycle state set on registered GraphQL artifacts.
const ARTIFACT_STATE_ENABLED: &str = "ENABLED";

/// Adapter reconciling the schema artifacts owned by a generation.
#[derive(Clone)]
pub struct RegistryAdapter {
    api: Arc<dyn RegistryApi>,
}

impl RegistryAdapter {
    /// Create a new instance.
    pub fn new(api: Arc<dyn RegistryApi>) -> Self {
        Self { api }
    }

    /// Reconcile the value schema and every GraphQL artifact of the generation.
    #[tracing::instrument(level = "debug", skip(self, names, schema))]
    pub async fn reconcile(&self, names: &NameSet, schema: &ValueSchema) -> ReconcileResult<()> {
        self.reconcile_value_schema(names, schema).await?;
        let graphql = schema.graphql_document();
        self.reconcile_graphql(&names.graphql_schema, &graphql).await?;
        for subgraph in &names.custom_subgraphs {
            self.reconcile_graphql(&subgraph.graphql_schema, &graphql).await?;
        }
        Ok(())
    }

    /// Register the Avro value schema: check existing versions, register when
    /// absent or drifted, then confirm the registry serves the content.
    async fn reconcile_value_schema(&self, names: &NameSet, schema: &ValueSchema) -> ReconcileResult<()> {
        let subject = &names.value_schema_subject;
        let desired = schema.avro_json();
        let versions = self.api.subject_versions(subject).await?;
        if versions.is_empty() {
            self.api.register_subject_version(subject, &desired).await?;
        } else if self.api.latest_subject_version(subject).await?.as_deref() != Some(desired.as_str()) {
            self.api.register_subject_version(subject, &desired).await?;
        }
        let latest = self.api.latest_subject_version(subject).await?;
        if latest.as_deref() != Some(desired.as_str()) {
            return Err(ReconcileError::Validation(format!("registry did not accept value schema for subject {}", subject)));
        }
        Ok(())
    }

    /// Register a GraphQL artifact: check existing versions, register the
    /// content, then set the artifact metadata.
    async fn reconcile_graphql(&self, artifact: &str, content: &str) -> ReconcileResult<()> {
        let versions = self.api.artifact_versions(artifact).await?;
        if !versions.is_empty() {
            return Ok(());
        }
        self.api.register_artifact(artifact, content).await?;
        self.api
            .set_artifact_meta(artifact, &ArtifactMeta { name: artifact.to_string(), state: ARTIFACT_STATE_ENABLED.into() })
            .await
    }

    /// Delete every schema artifact of the generation; absence is success.
    #[tracing::instrument(level = "debug", skip(self, names))]
    pub async fn delete(&self, names: &NameSet) -> ReconcileResult<()> {
        for subgraph in &names.custom_subgraphs {
            self.api.delete_artifact(&subgraph.graphql_schema).await?;
        }
        self.api.delete_artifact(&names.graphql_schema).await?;
        self.api.delete_subject(&names.value_schema_subject).await
    }

    /// Observe the health of the registered schema artifacts.
    #[tracing::instrument(level = "debug", skip(self, names))]
    pub async fn read_health(&self, names: &NameSet) -> ReconcileResult<Vec<(String, HealthStatus)>> {
        let mut members = Vec::new();
        let subject = if self.api.subject_versions(&names.value_schema_subject).await?.is_empty() {
            HealthStatus::Missing
        } else {
            HealthStatus::Healthy
        };
        members.push((names.value_schema_subject.clone(), subject));
        let mut artifacts = vec![names.graphql_schema.clone()];
        artifacts.extend(names.custom_subgraphs.iter().map(|subgraph| subgraph.graphql_schema.clone()));
        for artifact in artifacts {
            let status = if self.api.artifact_versions(&artifact).await?.is_empty() {
                HealthStatus::Missing
            } else {
                HealthStatus::Healthy
            };
            members.push((artifact, status));
        }
        Ok(members)
    }
}
