//! Lodestone CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

mod index_pipeline;

use kube::Resource;

pub use index_pipeline::{
    CustomSubgraphImage, FieldDefinition, FieldType, IndexPipeline, IndexPipelineSpec, IndexPipelineStatus, PipelineVersion, SourceRef,
    StatusCondition, TopicParams, ValidationThresholds, VersionState,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for IndexPipeline {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
