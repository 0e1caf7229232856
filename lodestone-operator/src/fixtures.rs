//! Test fixtures: recording in-memory backends, an in-memory pipeline store
//! and a fully wired reconciler harness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use serde_json::Value;

use crate::adapters::{ComputeAdapter, LogAdapter, RegistryAdapter, SearchAdapter};
use crate::backends::{ArtifactMeta, ComputeApi, ConnectorSpec, LogApi, RegistryApi, SearchApi, TopicSpec};
use crate::config::Config;
use crate::controller::{PipelineStore, Reconciler};
use crate::sync::GenerationSynchronizer;
use crate::tracker::VersionStateTracker;
use lodestone_core::crd::{CustomSubgraphImage, FieldDefinition, FieldType, IndexPipeline, IndexPipelineSpec, IndexPipelineStatus, SourceRef};
use lodestone_core::{ReconcileError, ReconcileResult};

/// Prefixes of recorded calls which mutate backend state.
const MUTATION_PREFIXES: &[&str] = &["put_", "delete_", "register_", "set_artifact_meta", "apply_deployment"];

/// Filter a recorded call log down to state-mutating calls.
pub fn mutations(calls: &[String]) -> Vec<String> {
    calls
        .iter()
        .filter(|call| MUTATION_PREFIXES.iter().any(|prefix| call.starts_with(prefix)))
        .cloned()
        .collect()
}

fn record(calls: &Mutex<Vec<String>>, call: String) {
    calls.lock().unwrap().push(call);
}

//////////////////////////////////////////////////////////////////////////////
// Log backend ///////////////////////////////////////////////////////////////

/// A recording in-memory `LogApi`.
pub struct RecordingLog {
    pub calls: Mutex<Vec<String>>,
    pub topics: Mutex<HashMap<String, TopicSpec>>,
    pub connectors: Mutex<HashMap<String, ConnectorSpec>>,
    /// Whether created connectors report their tasks as running.
    pub running: AtomicBool,
    /// Reported consumer lag, when set.
    pub lag: Mutex<Option<i64>>,
    /// Induces transient failures on topic writes while set.
    pub fail_topic_puts: AtomicBool,
}

impl RecordingLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Default::default(),
            topics: Default::default(),
            connectors: Default::default(),
            running: AtomicBool::new(true),
            lag: Mutex::new(None),
            fail_topic_puts: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogApi for RecordingLog {
    async fn get_topic(&self, name: &str) -> ReconcileResult<Option<TopicSpec>> {
        record(&self.calls, format!("get_topic {}", name));
        Ok(self.topics.lock().unwrap().get(name).cloned())
    }

    async fn put_topic(&self, name: &str, spec: &TopicSpec) -> ReconcileResult<()> {
        record(&self.calls, format!("put_topic {}", name));
        if self.fail_topic_puts.load(Ordering::SeqCst) {
            return Err(ReconcileError::transient("injected topic write failure"));
        }
        self.topics.lock().unwrap().insert(name.to_string(), spec.clone());
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("delete_topic {}", name));
        self.topics.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_connector(&self, name: &str) -> ReconcileResult<Option<ConnectorSpec>> {
        record(&self.calls, format!("get_connector {}", name));
        Ok(self.connectors.lock().unwrap().get(name).cloned())
    }

    async fn put_connector(&self, name: &str, spec: &ConnectorSpec) -> ReconcileResult<()> {
        record(&self.calls, format!("put_connector {}", name));
        self.connectors.lock().unwrap().insert(name.to_string(), spec.clone());
        Ok(())
    }

    async fn delete_connector(&self, name: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("delete_connector {}", name));
        self.connectors.lock().unwrap().remove(name);
        Ok(())
    }

    async fn connector_running(&self, name: &str) -> ReconcileResult<bool> {
        record(&self.calls, format!("connector_running {}", name));
        Ok(self.connectors.lock().unwrap().contains_key(name) && self.running.load(Ordering::SeqCst))
    }

    async fn connector_lag(&self, name: &str) -> ReconcileResult<Option<i64>> {
        record(&self.calls, format!("connector_lag {}", name));
        Ok(*self.lag.lock().unwrap())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Registry backend //////////////////////////////////////////////////////////

/// A recording in-memory `RegistryApi`.
#[derive(Default)]
pub struct RecordingRegistry {
    pub calls: Mutex<Vec<String>>,
    pub subjects: Mutex<HashMap<String, Vec<String>>>,
    pub artifacts: Mutex<HashMap<String, Vec<String>>>,
    pub metas: Mutex<HashMap<String, ArtifactMeta>>,
    /// Rejects value-schema registrations while set.
    pub fail_subject_registration: AtomicBool,
}

impl RecordingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryApi for RecordingRegistry {
    async fn subject_versions(&self, subject: &str) -> ReconcileResult<Vec<i64>> {
        record(&self.calls, format!("subject_versions {}", subject));
        let count = self.subjects.lock().unwrap().get(subject).map(Vec::len).unwrap_or(0);
        Ok((1..=count as i64).collect())
    }

    async fn latest_subject_version(&self, subject: &str) -> ReconcileResult<Option<String>> {
        record(&self.calls, format!("latest_subject_version {}", subject));
        Ok(self.subjects.lock().unwrap().get(subject).and_then(|versions| versions.last().cloned()))
    }

    async fn register_subject_version(&self, subject: &str, schema: &str) -> ReconcileResult<i64> {
        record(&self.calls, format!("register_subject_version {}", subject));
        if self.fail_subject_registration.load(Ordering::SeqCst) {
            return Err(ReconcileError::Validation("injected malformed schema rejection".into()));
        }
        let mut subjects = self.subjects.lock().unwrap();
        let versions = subjects.entry(subject.to_string()).or_default();
        versions.push(schema.to_string());
        Ok(versions.len() as i64)
    }

    async fn delete_subject(&self, subject: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("delete_subject {}", subject));
        self.subjects.lock().unwrap().remove(subject);
        Ok(())
    }

    async fn artifact_versions(&self, artifact: &str) -> ReconcileResult<Vec<i64>> {
        record(&self.calls, format!("artifact_versions {}", artifact));
        let count = self.artifacts.lock().unwrap().get(artifact).map(Vec::len).unwrap_or(0);
        Ok((1..=count as i64).collect())
    }

    async fn register_artifact(&self, artifact: &str, content: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("register_artifact {}", artifact));
        self.artifacts.lock().unwrap().entry(artifact.to_string()).or_default().push(content.to_string());
        Ok(())
    }

    async fn set_artifact_meta(&self, artifact: &str, meta: &ArtifactMeta) -> ReconcileResult<()> {
        record(&self.calls, format!("set_artifact_meta {}", artifact));
        self.metas.lock().unwrap().insert(artifact.to_string(), meta.clone());
        Ok(())
    }

    async fn delete_artifact(&self, artifact: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("delete_artifact {}", artifact));
        self.artifacts.lock().unwrap().remove(artifact);
        self.metas.lock().unwrap().remove(artifact);
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Search backend ////////////////////////////////////////////////////////////

/// A recording in-memory `SearchApi`.
pub struct RecordingSearch {
    pub calls: Mutex<Vec<String>>,
    pub indices: Mutex<HashMap<String, Value>>,
    pub pipelines: Mutex<HashMap<String, Value>>,
    pub documents: Mutex<i64>,
}

impl RecordingSearch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Default::default(),
            indices: Default::default(),
            pipelines: Default::default(),
            documents: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchApi for RecordingSearch {
    async fn index_exists(&self, name: &str) -> ReconcileResult<bool> {
        record(&self.calls, format!("index_exists {}", name));
        Ok(self.indices.lock().unwrap().contains_key(name))
    }

    async fn put_index(&self, name: &str, mapping: &Value) -> ReconcileResult<()> {
        record(&self.calls, format!("put_index {}", name));
        self.indices.lock().unwrap().insert(name.to_string(), mapping.clone());
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("delete_index {}", name));
        self.indices.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_ingest_pipeline(&self, name: &str) -> ReconcileResult<Option<Value>> {
        record(&self.calls, format!("get_ingest_pipeline {}", name));
        Ok(self.pipelines.lock().unwrap().get(name).cloned())
    }

    async fn put_ingest_pipeline(&self, name: &str, body: &Value) -> ReconcileResult<()> {
        record(&self.calls, format!("put_ingest_pipeline {}", name));
        self.pipelines.lock().unwrap().insert(name.to_string(), body.clone());
        Ok(())
    }

    async fn delete_ingest_pipeline(&self, name: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("delete_ingest_pipeline {}", name));
        self.pipelines.lock().unwrap().remove(name);
        Ok(())
    }

    async fn document_count(&self, index: &str) -> ReconcileResult<i64> {
        record(&self.calls, format!("document_count {}", index));
        Ok(*self.documents.lock().unwrap())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Compute backend ///////////////////////////////////////////////////////////

/// A recording in-memory `ComputeApi`.
pub struct RecordingCompute {
    pub calls: Mutex<Vec<String>>,
    pub deployments: Mutex<HashMap<String, Deployment>>,
    /// Whether applied deployments report their replicas as ready.
    pub ready: AtomicBool,
}

impl RecordingCompute {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Default::default(),
            deployments: Default::default(),
            ready: AtomicBool::new(true),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeApi for RecordingCompute {
    async fn get_deployment(&self, name: &str) -> ReconcileResult<Option<Deployment>> {
        record(&self.calls, format!("get_deployment {}", name));
        let mut deployment = match self.deployments.lock().unwrap().get(name).cloned() {
            Some(deployment) => deployment,
            None => return Ok(None),
        };
        if self.ready.load(Ordering::SeqCst) {
            let replicas = deployment.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
            deployment.status = Some(DeploymentStatus { ready_replicas: Some(replicas), ..Default::default() });
        }
        Ok(Some(deployment))
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> ReconcileResult<()> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        record(&self.calls, format!("apply_deployment {}", name));
        self.deployments.lock().unwrap().insert(name, deployment.clone());
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> ReconcileResult<()> {
        record(&self.calls, format!("delete_deployment {}", name));
        self.deployments.lock().unwrap().remove(name);
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pipeline store ////////////////////////////////////////////////////////////

/// An in-memory `PipelineStore` with optimistic-concurrency semantics.
#[derive(Default)]
pub struct MemStore {
    pub pipelines: Mutex<HashMap<String, IndexPipeline>>,
    /// Number of status updates which will be rejected with a conflict.
    pub forced_conflicts: AtomicU32,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a pipeline record, assigning an initial resource version.
    pub fn put(&self, mut pipeline: IndexPipeline) {
        let name = pipeline.meta().name.clone().expect("test pipeline must have a name");
        if pipeline.meta().resource_version.is_none() {
            pipeline.meta_mut().resource_version = Some("1".into());
        }
        self.pipelines.lock().unwrap().insert(name, pipeline);
    }

    /// Fetch the current record; panics when absent.
    pub fn current(&self, name: &str) -> IndexPipeline {
        self.pipelines.lock().unwrap().get(name).cloned().expect("pipeline not found in store")
    }

    /// Whether the record still exists in the store.
    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.lock().unwrap().contains_key(name)
    }

    /// Mark the record for deletion, as the orchestration runtime does when a
    /// finalizer is still attached.
    pub fn mark_deleted(&self, name: &str) {
        let mut pipelines = self.pipelines.lock().unwrap();
        let pipeline = pipelines.get_mut(name).expect("pipeline not found in store");
        pipeline.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
    }

    /// Reject the next `count` status updates with a conflict.
    pub fn force_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    fn bump(pipeline: &mut IndexPipeline) {
        let next = pipeline
            .meta()
            .resource_version
            .as_deref()
            .and_then(|version| version.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        pipeline.meta_mut().resource_version = Some(next.to_string());
    }
}

#[async_trait]
impl PipelineStore for MemStore {
    async fn get(&self, name: &str) -> ReconcileResult<Option<IndexPipeline>> {
        Ok(self.pipelines.lock().unwrap().get(name).cloned())
    }

    async fn update_status(&self, pipeline: &IndexPipeline, status: &IndexPipelineStatus) -> ReconcileResult<IndexPipeline> {
        if self.forced_conflicts.load(Ordering::SeqCst) > 0 {
            self.forced_conflicts.fetch_sub(1, Ordering::SeqCst);
            return Err(ReconcileError::Conflict("injected conflict".into()));
        }
        let name = pipeline.meta().name.clone().unwrap_or_default();
        let mut pipelines = self.pipelines.lock().unwrap();
        let stored = pipelines
            .get_mut(&name)
            .ok_or_else(|| ReconcileError::Conflict("pipeline no longer exists".into()))?;
        if stored.meta().resource_version != pipeline.meta().resource_version {
            return Err(ReconcileError::Conflict("stale resource version".into()));
        }
        stored.status = Some(status.clone());
        Self::bump(stored);
        Ok(stored.clone())
    }

    async fn ensure_finalizer(&self, pipeline: &IndexPipeline) -> ReconcileResult<bool> {
        let name = pipeline.meta().name.clone().unwrap_or_default();
        let mut pipelines = self.pipelines.lock().unwrap();
        let stored = pipelines
            .get_mut(&name)
            .ok_or_else(|| ReconcileError::Conflict("pipeline no longer exists".into()))?;
        let finalizers = stored.meta_mut().finalizers.get_or_insert_with(Default::default);
        if finalizers.iter().any(|finalizer| finalizer == crate::controller::FINALIZER) {
            return Ok(false);
        }
        finalizers.push(crate::controller::FINALIZER.into());
        Self::bump(stored);
        Ok(true)
    }

    async fn remove_finalizer(&self, pipeline: &IndexPipeline) -> ReconcileResult<()> {
        let name = pipeline.meta().name.clone().unwrap_or_default();
        let mut pipelines = self.pipelines.lock().unwrap();
        let stored = match pipelines.get_mut(&name) {
            Some(stored) => stored,
            None => return Ok(()),
        };
        if let Some(finalizers) = stored.meta_mut().finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != crate::controller::FINALIZER);
        }
        Self::bump(stored);
        // With the finalizer released, the store finalizes deletion.
        if stored.meta().deletion_timestamp.is_some() {
            pipelines.remove(&name);
        }
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Builders //////////////////////////////////////////////////////////////////

pub fn field(name: &str, field_type: FieldType) -> FieldDefinition {
    FieldDefinition { name: name.into(), field_type }
}

/// Field definitions with no semi-structured members.
pub fn plain_fields() -> Vec<FieldDefinition> {
    vec![field("id", FieldType::String), field("count", FieldType::Integer)]
}

/// Build a pipeline definition for tests.
pub fn test_pipeline(name: &str, fields: Vec<FieldDefinition>, custom_subgraph_images: Vec<CustomSubgraphImage>) -> IndexPipeline {
    let mut pipeline = IndexPipeline::new(
        name,
        IndexPipelineSpec {
            sources: vec![SourceRef { name: "src1".into(), topic: "datasource.src1.g0".into() }],
            fields,
            custom_subgraph_images,
            topic: None,
            pause: false,
            validation: None,
        },
    );
    pipeline.meta_mut().namespace = Some("default".into());
    pipeline
}

//////////////////////////////////////////////////////////////////////////////
// Harness ///////////////////////////////////////////////////////////////////

/// A fully wired reconciler over recording backends and an in-memory store.
pub struct Harness {
    pub config: Arc<Config>,
    pub store: Arc<MemStore>,
    pub log: Arc<RecordingLog>,
    pub registry: Arc<RecordingRegistry>,
    pub search: Arc<RecordingSearch>,
    pub compute: Arc<RecordingCompute>,
    pub sync: GenerationSynchronizer,
    pub tracker: VersionStateTracker,
    pub reconciler: Reconciler,
}

/// Build a harness with healthy backends and an empty store.
pub fn harness() -> Harness {
    harness_with_config(Config::new_test())
}

/// Build a harness with the given config.
pub fn harness_with_config(config: Arc<Config>) -> Harness {
    let store = MemStore::new();
    let log = RecordingLog::new();
    let registry = RecordingRegistry::new();
    let search = RecordingSearch::new();
    let compute = RecordingCompute::new();

    let log_adapter = LogAdapter::new(log.clone(), config.clone());
    let registry_adapter = RegistryAdapter::new(registry.clone());
    let search_adapter = SearchAdapter::new(search.clone());
    let compute_adapter = ComputeAdapter::new(compute.clone(), config.clone());

    let sync = GenerationSynchronizer::new(log_adapter.clone(), registry_adapter.clone(), search_adapter.clone(), compute_adapter.clone());
    let tracker = VersionStateTracker::new(log_adapter, registry_adapter, search_adapter, compute_adapter);
    let reconciler = Reconciler::new(config.clone(), store.clone(), sync.clone(), tracker.clone());

    Harness { config, store, log, registry, search, compute, sync, tracker, reconciler }
}
