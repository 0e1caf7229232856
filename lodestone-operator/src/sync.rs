//! The generation synchronizer.
//!
//! Materializes one generation's managed resource set across every backend,
//! in dependency order, and tears it down in exact reverse order. Steps are
//! idempotent: on any error the pass aborts and already-applied steps are
//! left in place to be re-applied or reconciled again on retry. There is no
//! rollback.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::adapters::{ComputeAdapter, LogAdapter, RegistryAdapter, SearchAdapter};
use crate::names::NameSet;
use lodestone_core::crd::{IndexPipeline, RequiredMetadata};
use lodestone_core::schema::ValueSchema;
use lodestone_core::{ReconcileError, ReconcileResult};

/// Upper bound on a single materialization or teardown step.
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrates the backend adapters to materialize one generation.
#[derive(Clone)]
pub struct GenerationSynchronizer {
    log: LogAdapter,
    registry: RegistryAdapter,
    search: SearchAdapter,
    compute: ComputeAdapter,
}

impl GenerationSynchronizer {
    /// Create a new instance.
    pub fn new(log: LogAdapter, registry: RegistryAdapter, search: SearchAdapter, compute: ComputeAdapter) -> Self {
        Self { log, registry, search, compute }
    }

    /// Materialize the managed resource set of one generation.
    ///
    /// Ordering: schema artifacts and the topic precede the connector which
    /// references them; the index and ingest pipeline precede the compute
    /// deployments which reference the index; deployments come last.
    #[tracing::instrument(level = "debug", skip(self, pipeline), fields(pipeline = pipeline.name()))]
    pub async fn materialize(&self, pipeline: &IndexPipeline, generation: &str) -> ReconcileResult<()> {
        let names = NameSet::derive(pipeline.name(), generation, &pipeline.spec.custom_subgraph_images);
        let schema = ValueSchema::new(pipeline.name(), &pipeline.spec.fields);
        tracing::debug!(%generation, "materializing generation");

        bounded(self.registry.reconcile(&names, &schema)).await?;
        bounded(self.log.reconcile_topic(pipeline, &names)).await?;
        bounded(self.search.reconcile(&names, &schema)).await?;
        bounded(self.log.reconcile_connector(pipeline, &names, &schema)).await?;
        bounded(self.compute.reconcile(pipeline, &names, &schema)).await?;
        Ok(())
    }

    /// Tear down the managed resource set of one generation, in reverse of
    /// creation order so no member ever dangles a reference to a deleted one.
    #[tracing::instrument(level = "debug", skip(self, pipeline), fields(pipeline = pipeline.name()))]
    pub async fn teardown(&self, pipeline: &IndexPipeline, generation: &str) -> ReconcileResult<()> {
        let names = NameSet::derive(pipeline.name(), generation, &pipeline.spec.custom_subgraph_images);
        tracing::debug!(%generation, "tearing down generation");

        bounded(self.compute.delete(&names)).await?;
        bounded(self.log.delete_connector(&names)).await?;
        bounded(self.search.delete(&names)).await?;
        bounded(self.log.delete_topic(&names)).await?;
        bounded(self.registry.delete(&names)).await?;
        Ok(())
    }
}

/// Bound one synchronization step; an elapsed timeout is a transient failure.
async fn bounded<F>(step: F) -> ReconcileResult<()>
where
    F: Future<Output = ReconcileResult<()>>,
{
    match timeout(STEP_TIMEOUT, step).await {
        Ok(res) => res,
        Err(_) => Err(ReconcileError::transient("synchronization step timed out")),
    }
}
