//! IndexPipeline CRD.
//!
//! The code here is used to generate the actual CRD used in K8s.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type IndexPipeline = IndexPipelineCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the IndexPipeline resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "IndexPipelineCRD",
    status = "IndexPipelineStatus",
    group = "lodestone.rs",
    version = "v1",
    kind = "IndexPipeline",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "indexpipeline",
    printcolumn = r#"{"name":"Active Generation","type":"string","jsonPath":".status.activeGeneration"}"#
)]
pub struct IndexPipelineSpec {
    /// The data sources whose topics feed this pipeline's core process.
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    /// The fields of the indexed document, from which the value schema,
    /// index mapping and GraphQL schema are all derived.
    pub fields: Vec<FieldDefinition>,
    /// Additional API subgraph images to deploy alongside the generic subgraph.
    #[serde(default, rename = "customSubgraphImages")]
    pub custom_subgraph_images: Vec<CustomSubgraphImage>,
    /// Tuning parameters for the sink topic.
    #[serde(default)]
    pub topic: Option<TopicParams>,
    /// Whether the sink connector should be created in a paused state.
    #[serde(default)]
    pub pause: bool,
    /// Thresholds which must be satisfied before a generation may be promoted.
    #[serde(default)]
    pub validation: Option<ValidationThresholds>,
}

/// A reference to a data source consumed by the pipeline.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct SourceRef {
    /// The name of the data source.
    pub name: String,
    /// The topic on which the data source publishes its change events.
    pub topic: String,
}

/// A single field of the indexed document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct FieldDefinition {
    /// The name of this field, which is unique per pipeline.
    pub name: String,
    /// The type of this field.
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// The type of an indexed field.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Boolean,
    Integer,
    Float,
    Date,
    /// A semi-structured field carried as serialized JSON; its presence
    /// requires an ingest pipeline on the search side.
    Json,
}

/// An additional API subgraph image deployed for this pipeline.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct CustomSubgraphImage {
    /// The identifier of this subgraph, appended to derived resource names.
    pub name: String,
    /// The container image to deploy.
    pub image: String,
}

/// Tuning parameters for the pipeline's sink topic.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct TopicParams {
    /// The number of topic partitions.
    pub partitions: i32,
    /// The replication factor of the topic.
    #[serde(rename = "replicationFactor")]
    pub replication_factor: i32,
    /// Retention of topic data in milliseconds.
    #[serde(rename = "retentionMs")]
    pub retention_ms: i64,
}

impl Default for TopicParams {
    fn default() -> Self {
        Self { partitions: 1, replication_factor: 1, retention_ms: 604_800_000 }
    }
}

/// Promotion gates evaluated against the materialized backends.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ValidationThresholds {
    /// Maximum total consumer lag of the sink connector.
    #[serde(default, rename = "maxConnectorLag")]
    pub max_connector_lag: Option<i64>,
    /// Minimum number of documents expected in the index.
    #[serde(default, rename = "minDocumentCount")]
    pub min_document_count: Option<i64>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct IndexPipelineStatus {
    /// The generation currently serving traffic; at most one.
    #[serde(default, rename = "activeGeneration")]
    pub active_generation: Option<String>,
    /// Every generation which has been minted and not yet forgotten.
    #[serde(default)]
    pub versions: Vec<PipelineVersion>,
    /// Conditions describing recent reconciliation outcomes.
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
}

impl IndexPipelineStatus {
    /// Get the tracked version of the given generation.
    pub fn version(&self, generation: &str) -> Option<&PipelineVersion> {
        self.versions.iter().find(|version| version.generation == generation)
    }

    /// Get a mutable handle to the tracked version of the given generation.
    pub fn version_mut(&mut self, generation: &str) -> Option<&mut PipelineVersion> {
        self.versions.iter_mut().find(|version| version.generation == generation)
    }

    /// Whether a live generation exists which materializes the given spec.
    ///
    /// A live generation with a different spec hash does not count: the
    /// definition has changed since it was minted and a replacement
    /// generation is required.
    pub fn has_current_version(&self, spec_hash: &str) -> bool {
        self.versions.iter().any(|version| {
            matches!(version.state, VersionState::New | VersionState::Valid | VersionState::Active) && version.spec_hash == spec_hash
        })
    }

    /// Record a condition, replacing any previous condition of the same type.
    pub fn set_condition(&mut self, condition: StatusCondition) {
        self.conditions.retain(|current| current.type_ != condition.type_);
        self.conditions.push(condition);
    }

    /// Drop the condition of the given type, if present.
    pub fn clear_condition(&mut self, type_: &str) {
        self.conditions.retain(|current| current.type_ != type_);
    }
}

/// The tracked state of one materialized generation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct PipelineVersion {
    /// The generation token of this version.
    pub generation: String,
    /// The lifecycle state of this version.
    pub state: VersionState,
    /// Hash of the pipeline spec this generation materializes.
    #[serde(default, rename = "specHash")]
    pub spec_hash: String,
    /// Materialization attempts consumed by this version.
    #[serde(default)]
    pub attempts: u32,
    /// RFC 3339 timestamp at which this version was demoted to Standby.
    #[serde(default, rename = "demotedAt")]
    pub demoted_at: Option<String>,
    /// Human readable detail of the most recent state change or failure.
    #[serde(default)]
    pub message: Option<String>,
}

impl PipelineVersion {
    /// Create a tracking record for a freshly minted generation.
    pub fn new(generation: impl Into<String>, spec_hash: impl Into<String>) -> Self {
        Self {
            generation: generation.into(),
            state: VersionState::New,
            spec_hash: spec_hash.into(),
            attempts: 0,
            demoted_at: None,
            message: None,
        }
    }
}

/// The lifecycle state of a pipeline generation.
///
/// Transitions are driven exclusively by the lifecycle controller.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum VersionState {
    /// Just created, not yet confirmed healthy.
    New,
    /// Every member of the managed resource set is confirmed healthy.
    Valid,
    /// Serving traffic; at most one per pipeline.
    Active,
    /// Previously active, retained during the blue/green transition window.
    Standby,
    /// Teardown of the managed resource set is in progress.
    Removing,
    /// Terminal; every member of the managed resource set has been deleted.
    Removed,
}

/// A single entry of the status conditions list.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct StatusCondition {
    /// The condition type, e.g. `Available` or `ReconcileFailed`.
    #[serde(rename = "type")]
    pub type_: String,
    /// The condition status: `True`, `False` or `Unknown`.
    pub status: String,
    /// A machine readable reason for the condition.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human readable detail.
    #[serde(default)]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last transition of this condition.
    #[serde(default, rename = "lastTransitionTime")]
    pub last_transition_time: Option<String>,
}
