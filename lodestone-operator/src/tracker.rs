//! Version state tracking.
//!
//! The tracker never mutates anything: it polls the read side of every
//! adapter for every member of a generation's managed resource set and
//! reports whether the generation may be considered valid. Health is
//! observed asynchronously relative to the controller, so the result is only
//! ever a snapshot and is re-evaluated on every reconcile tick.

use crate::adapters::{ComputeAdapter, LogAdapter, RegistryAdapter, SearchAdapter};
use crate::backends::HealthStatus;
use crate::names::NameSet;
use lodestone_core::crd::{IndexPipeline, RequiredMetadata};
use lodestone_core::schema::ValueSchema;
use lodestone_core::ReconcileResult;

/// The observed health of one generation's managed resource set.
#[derive(Clone, Debug)]
pub struct VersionHealth {
    /// Every member of the resource set with its observed status.
    pub members: Vec<(String, HealthStatus)>,
    /// Failed promotion gates from the pipeline's validation thresholds.
    pub gate_failures: Vec<String>,
}

impl VersionHealth {
    /// A generation is valid only when every member is healthy and every
    /// configured promotion gate passed.
    pub fn is_valid(&self) -> bool {
        self.members.iter().all(|(_, status)| status.is_healthy()) && self.gate_failures.is_empty()
    }

    /// Human readable summary of everything blocking validity.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (name, status) in &self.members {
            match status {
                HealthStatus::Healthy => continue,
                HealthStatus::Missing => parts.push(format!("{} is missing", name)),
                HealthStatus::Pending(detail) => parts.push(format!("{} is pending: {}", name, detail)),
            }
        }
        parts.extend(self.gate_failures.iter().cloned());
        if parts.is_empty() {
            "all members healthy".into()
        } else {
            parts.join("; ")
        }
    }
}

/// Computes a generation's lifecycle state from backend health observations.
#[derive(Clone)]
pub struct VersionStateTracker {
    log: LogAdapter,
    registry: RegistryAdapter,
    search: SearchAdapter,
    compute: ComputeAdapter,
}

impl VersionStateTracker {
    /// Create a new instance.
    pub fn new(log: LogAdapter, registry: RegistryAdapter, search: SearchAdapter, compute: ComputeAdapter) -> Self {
        Self { log, registry, search, compute }
    }

    /// Evaluate the health of one generation's managed resource set.
    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    pub async fn evaluate(&self, pipeline: &IndexPipeline, generation: &str) -> ReconcileResult<VersionHealth> {
        let names = NameSet::derive(pipeline.name(), generation, &pipeline.spec.custom_subgraph_images);
        let schema = ValueSchema::new(pipeline.name(), &pipeline.spec.fields);

        let mut members = Vec::new();
        members.extend(self.log.read_health(&names).await?);
        members.extend(self.registry.read_health(&names).await?);
        members.extend(self.search.read_health(&names, &schema).await?);
        members.extend(self.compute.read_health(&names).await?);

        let mut gate_failures = Vec::new();
        if let Some(thresholds) = &pipeline.spec.validation {
            if let Some(max_lag) = thresholds.max_connector_lag {
                if let Some(lag) = self.log.connector_lag(&names).await? {
                    if lag > max_lag {
                        gate_failures.push(format!("connector lag {} exceeds threshold {}", lag, max_lag));
                    }
                }
            }
            if let Some(min_documents) = thresholds.min_document_count {
                let count = self.search.document_count(&names).await?;
                if count < min_documents {
                    gate_failures.push(format!("document count {} below threshold {}", count, min_documents));
                }
            }
        }

        Ok(VersionHealth { members, gate_failures })
    }
}
