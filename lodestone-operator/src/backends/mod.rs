//! Capability interfaces for the backend systems.
//!
//! The adapters in `crate::adapters` speak to the outside world exclusively
//! through these traits. Each trait is the minimal `put/get/delete by name`
//! surface one backend exposes; concrete wire clients implement them, and the
//! tests drive the adapters with recording in-memory implementations. Every
//! implementation must be safe for concurrent use by reconciles of distinct
//! pipelines targeting distinct names.

mod http;
mod kube;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::Value;

use lodestone_core::ReconcileResult;

pub use self::http::{HttpRegistryApi, HttpSearchApi};
pub use self::kube::{KubeComputeApi, KubeLogApi};
pub(crate) use self::kube::kube_classify;

/// Health of a single managed backend resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    /// The resource exists and reports ready.
    Healthy,
    /// The resource exists but is not yet ready.
    Pending(String),
    /// The resource does not exist.
    Missing,
}

impl HealthStatus {
    /// Whether this resource counts toward a valid generation.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Desired state of a log topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSpec {
    /// The number of topic partitions.
    pub partitions: i32,
    /// The replication factor of the topic.
    pub replication_factor: i32,
    /// Topic-level config entries, e.g. retention.
    pub config: BTreeMap<String, String>,
}

/// Desired state of a sink/source connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorSpec {
    /// The connector class to instantiate.
    pub class: String,
    /// Whether the connector should be paused.
    pub pause: bool,
    /// The connector's JSON config blob.
    pub config: Value,
}

/// Metadata attached to a registry artifact after registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactMeta {
    /// The display name of the artifact.
    pub name: String,
    /// The lifecycle state of the artifact, e.g. `ENABLED`.
    pub state: String,
}

/// The message-log platform: topics and connectors addressed by name.
#[async_trait]
pub trait LogApi: Send + Sync {
    async fn get_topic(&self, name: &str) -> ReconcileResult<Option<TopicSpec>>;
    async fn put_topic(&self, name: &str, spec: &TopicSpec) -> ReconcileResult<()>;
    async fn delete_topic(&self, name: &str) -> ReconcileResult<()>;

    async fn get_connector(&self, name: &str) -> ReconcileResult<Option<ConnectorSpec>>;
    async fn put_connector(&self, name: &str, spec: &ConnectorSpec) -> ReconcileResult<()>;
    async fn delete_connector(&self, name: &str) -> ReconcileResult<()>;

    /// Whether the named connector and all of its tasks are running.
    async fn connector_running(&self, name: &str) -> ReconcileResult<bool>;
    /// Total consumer lag across the connector's tasks, when the platform reports it.
    async fn connector_lag(&self, name: &str) -> ReconcileResult<Option<i64>>;
}

/// The schema registry: Avro value-schema subjects and GraphQL artifacts.
///
/// The two artifact families live in separate registry namespaces and are
/// addressed independently.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// List the registered version numbers of a value-schema subject.
    async fn subject_versions(&self, subject: &str) -> ReconcileResult<Vec<i64>>;
    /// Fetch the latest registered content of a value-schema subject.
    async fn latest_subject_version(&self, subject: &str) -> ReconcileResult<Option<String>>;
    /// Register a new version of a value-schema subject.
    async fn register_subject_version(&self, subject: &str, schema: &str) -> ReconcileResult<i64>;
    async fn delete_subject(&self, subject: &str) -> ReconcileResult<()>;

    /// List the registered version numbers of a GraphQL artifact.
    async fn artifact_versions(&self, artifact: &str) -> ReconcileResult<Vec<i64>>;
    /// Register the content of a GraphQL artifact.
    async fn register_artifact(&self, artifact: &str, content: &str) -> ReconcileResult<()>;
    /// Set the metadata of a registered GraphQL artifact.
    async fn set_artifact_meta(&self, artifact: &str, meta: &ArtifactMeta) -> ReconcileResult<()>;
    async fn delete_artifact(&self, artifact: &str) -> ReconcileResult<()>;
}

/// The search engine: indices and ingest pipelines addressed by name.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn index_exists(&self, name: &str) -> ReconcileResult<bool>;
    async fn put_index(&self, name: &str, mapping: &Value) -> ReconcileResult<()>;
    async fn delete_index(&self, name: &str) -> ReconcileResult<()>;

    async fn get_ingest_pipeline(&self, name: &str) -> ReconcileResult<Option<Value>>;
    async fn put_ingest_pipeline(&self, name: &str, body: &Value) -> ReconcileResult<()>;
    async fn delete_ingest_pipeline(&self, name: &str) -> ReconcileResult<()>;

    /// The number of documents currently held by the named index.
    async fn document_count(&self, index: &str) -> ReconcileResult<i64>;
}

/// The compute platform: Deployment-shaped resources addressed by name.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_deployment(&self, name: &str) -> ReconcileResult<Option<Deployment>>;
    async fn apply_deployment(&self, deployment: &Deployment) -> ReconcileResult<()>;
    async fn delete_deployment(&self, name: &str) -> ReconcileResult<()>;
}
