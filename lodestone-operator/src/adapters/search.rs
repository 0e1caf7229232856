//! The search-index adapter: index and conditional ingest pipeline.

use std::sync::Arc;

use crate::backends::{HealthStatus, SearchApi};
use crate::names::NameSet;
use lodestone_core::schema::ValueSchema;
use lodestone_core::ReconcileResult;

/// Adapter reconciling the search resources owned by a generation.
#[derive(Clone)]
pub struct SearchAdapter {
    api: Arc<dyn SearchApi>,
}

impl SearchAdapter {
    /// Create a new instance.
    pub fn new(api: Arc<dyn SearchApi>) -> Self {
        Self { api }
    }

    /// Reconcile the generation's index and, when the schema requires one,
    /// its ingest pipeline.
    #[tracing::instrument(level = "debug", skip(self, names, schema))]
    pub async fn reconcile(&self, names: &NameSet, schema: &ValueSchema) -> ReconcileResult<()> {
        if !self.api.index_exists(&names.index).await? {
            self.api.put_index(&names.index, &schema.index_mapping()).await?;
        }
        if let Some(body) = schema.ingest_pipeline() {
            // Existence is checked before any write to decide create vs
            // update semantics.
            let current = self.api.get_ingest_pipeline(&names.ingest_pipeline).await?;
            if current.as_ref() != Some(&body) {
                self.api.put_ingest_pipeline(&names.ingest_pipeline, &body).await?;
            }
        }
        Ok(())
    }

    /// Delete the generation's search resources; absence is success.
    #[tracing::instrument(level = "debug", skip(self, names))]
    pub async fn delete(&self, names: &NameSet) -> ReconcileResult<()> {
        self.api.delete_ingest_pipeline(&names.ingest_pipeline).await?;
        self.api.delete_index(&names.index).await
    }

    /// Observe the health of the index and ingest pipeline.
    #[tracing::instrument(level = "debug", skip(self, names, schema))]
    pub async fn read_health(&self, names: &NameSet, schema: &ValueSchema) -> ReconcileResult<Vec<(String, HealthStatus)>> {
        let mut members = Vec::new();
        let index = if self.api.index_exists(&names.index).await? {
            HealthStatus::Healthy
        } else {
            HealthStatus::Missing
        };
        members.push((names.index.clone(), index));
        if schema.has_json_fields() {
            let pipeline = match self.api.get_ingest_pipeline(&names.ingest_pipeline).await? {
                Some(_) => HealthStatus::Healthy,
                None => HealthStatus::Missing,
            };
            members.push((format!("{} (ingest pipeline)", names.ingest_pipeline), pipeline));
        }
        Ok(members)
    }

    /// The number of documents currently held by the generation's index.
    pub async fn document_count(&self, names: &NameSet) -> ReconcileResult<i64> {
        self.api.document_count(&names.index).await
    }
}
