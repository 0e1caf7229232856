//! The declarative resource store holding IndexPipeline records.
//!
//! The store is the only place the controller writes shared mutable state.
//! Every write goes through a read-modify-write path with conflict
//! detection: a stale resource version surfaces as `ReconcileError::Conflict`
//! and the caller re-reads and retries the whole pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::client::Client;
use kube::Resource;
use tokio::time::timeout;

use crate::backends::kube_classify;
use crate::config::Config;
use lodestone_core::crd::{IndexPipeline, IndexPipelineStatus, RequiredMetadata};
use lodestone_core::{ReconcileError, ReconcileResult};

/// The finalizer marker gating permanent deletion of pipeline records.
pub const FINALIZER: &str = "indexpipeline.finalizers.lodestone.rs";

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The declarative store of pipeline definitions and their observed status.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Fetch the named pipeline; `None` when it no longer exists.
    async fn get(&self, name: &str) -> ReconcileResult<Option<IndexPipeline>>;

    /// Persist the given status, returning the updated record.
    ///
    /// Fails with `ReconcileError::Conflict` when the given record is stale.
    async fn update_status(&self, pipeline: &IndexPipeline, status: &IndexPipelineStatus) -> ReconcileResult<IndexPipeline>;

    /// Attach the finalizer marker; returns `true` when it was newly attached.
    async fn ensure_finalizer(&self, pipeline: &IndexPipeline) -> ReconcileResult<bool>;

    /// Remove the finalizer marker, allowing the store to finalize deletion.
    async fn remove_finalizer(&self, pipeline: &IndexPipeline) -> ReconcileResult<()>;
}

/// A `PipelineStore` implementation backed by the Kubernetes API.
pub struct KubePipelineStore {
    client: Client,
    config: Arc<Config>,
}

impl KubePipelineStore {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    fn api(&self) -> Api<IndexPipeline> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }
}

#[async_trait]
impl PipelineStore for KubePipelineStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, name: &str) -> ReconcileResult<Option<IndexPipeline>> {
        let res = timeout(API_TIMEOUT, self.api().get(name))
            .await
            .map_err(|_| ReconcileError::transient("timeout while fetching pipeline"))?;
        match res {
            Ok(pipeline) => Ok(Some(pipeline)),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(kube_classify(err, "error fetching pipeline")),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pipeline, status))]
    async fn update_status(&self, pipeline: &IndexPipeline, status: &IndexPipelineStatus) -> ReconcileResult<IndexPipeline> {
        let mut updated = pipeline.clone();
        updated.status = Some(status.clone());
        updated.metadata.managed_fields = None;
        let data = serde_json::to_vec(&updated)
            .map_err(|err| ReconcileError::Validation(format!("error serializing pipeline status: {}", err)))?;
        timeout(API_TIMEOUT, self.api().replace_status(pipeline.name(), &PostParams::default(), data))
            .await
            .map_err(|_| ReconcileError::transient("timeout while updating pipeline status"))?
            .map_err(|err| kube_classify(err, "error updating pipeline status"))
    }

    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn ensure_finalizer(&self, pipeline: &IndexPipeline) -> ReconcileResult<bool> {
        let finalizers = pipeline.meta().finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|finalizer| finalizer == FINALIZER) {
            return Ok(false);
        }
        tracing::info!(pipeline = pipeline.name(), "attaching finalizer");
        let mut updated = pipeline.clone();
        let finalizers = updated.meta_mut().finalizers.get_or_insert_with(Default::default);
        finalizers.push(FINALIZER.into());
        timeout(API_TIMEOUT, self.api().replace(pipeline.name(), &PostParams::default(), &updated))
            .await
            .map_err(|_| ReconcileError::transient("timeout while attaching finalizer"))?
            .map_err(|err| kube_classify(err, "error attaching finalizer"))?;
        Ok(true)
    }

    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn remove_finalizer(&self, pipeline: &IndexPipeline) -> ReconcileResult<()> {
        let finalizers = pipeline.meta().finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|finalizer| finalizer == FINALIZER) {
            return Ok(());
        }
        tracing::info!(pipeline = pipeline.name(), "removing finalizer");
        let mut updated = pipeline.clone();
        if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != FINALIZER);
        }
        timeout(API_TIMEOUT, self.api().replace(pipeline.name(), &PostParams::default(), &updated))
            .await
            .map_err(|_| ReconcileError::transient("timeout while removing finalizer"))?
            .map_err(|err| kube_classify(err, "error removing finalizer"))?;
        Ok(())
    }
}
