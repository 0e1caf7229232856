//! Deterministic resource naming for pipeline generations.
//!
//! Every backend artifact belonging to one generation is named here and
//! nowhere else. The scheme is `<prefix>.<pipeline>[-<subgraph>].<generation>`
//! for primary artifacts; compute deployment names are the dash-joined form
//! of the same, with the core deployment carrying an additional component
//! tag. Two distinct `(pipeline, generation)` pairs never collide, which is
//! what makes stale backend artifacts impossible to adopt by accident.

use std::collections::BTreeMap;

use maplit::btreemap;

use lodestone_core::crd::CustomSubgraphImage;

/// Prefix applied to every resource owned by an IndexPipeline.
pub const KIND_PREFIX: &str = "indexpipeline";
/// Component tag prefixed onto core deployment names.
pub const CORE_COMPONENT: &str = "lodestone-core";
/// The label grouping all generations of one pipeline for selection together.
pub const LABEL_INDEX: &str = "lodestone.rs/index";

/// The derived names of every backend artifact belonging to one generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameSet {
    /// The generation these names belong to.
    pub generation: String,
    /// The sink topic.
    pub topic: String,
    /// The sink connector.
    pub connector: String,
    /// The Avro value-schema subject.
    pub value_schema_subject: String,
    /// The generic GraphQL schema artifact.
    pub graphql_schema: String,
    /// The search index.
    pub index: String,
    /// The ingest pipeline; only materialized when the schema requires one.
    pub ingest_pipeline: String,
    /// The core compute deployment.
    pub core_deployment: String,
    /// The generic API subgraph deployment.
    pub subgraph_deployment: String,
    /// Names derived per custom subgraph image.
    pub custom_subgraphs: Vec<SubgraphNames>,
}

/// The derived names of one custom subgraph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubgraphNames {
    /// The subgraph identifier from the pipeline definition.
    pub id: String,
    /// The container image to deploy for this subgraph.
    pub image: String,
    /// The GraphQL schema artifact registered for this subgraph.
    pub graphql_schema: String,
    /// The subgraph's deployment.
    pub deployment: String,
}

impl NameSet {
    /// Derive the full name set for one generation of a pipeline.
    pub fn derive(pipeline: &str, generation: &str, custom_subgraphs: &[CustomSubgraphImage]) -> Self {
        let base = format!("{}.{}.{}", KIND_PREFIX, pipeline, generation);
        let dashed = base.replace('.', "-");
        let custom_subgraphs = custom_subgraphs
            .iter()
            .map(|subgraph| {
                let artifact = format!("{}.{}-{}.{}", KIND_PREFIX, pipeline, subgraph.name, generation);
                SubgraphNames {
                    id: subgraph.name.clone(),
                    image: subgraph.image.clone(),
                    deployment: artifact.replace('.', "-"),
                    graphql_schema: artifact,
                }
            })
            .collect();
        Self {
            generation: generation.to_string(),
            topic: base.clone(),
            connector: base.clone(),
            value_schema_subject: format!("{}-value", base),
            graphql_schema: base.clone(),
            index: base.clone(),
            ingest_pipeline: base,
            core_deployment: format!("{}-{}", CORE_COMPONENT, dashed),
            subgraph_deployment: dashed,
            custom_subgraphs,
        }
    }

    /// All derived names, used for disjointness checks across generations.
    pub fn all(&self) -> Vec<&str> {
        let mut names = vec![
            self.topic.as_str(),
            self.value_schema_subject.as_str(),
            self.graphql_schema.as_str(),
            self.core_deployment.as_str(),
            self.subgraph_deployment.as_str(),
        ];
        for subgraph in &self.custom_subgraphs {
            names.push(subgraph.graphql_schema.as_str());
            names.push(subgraph.deployment.as_str());
        }
        names
    }
}

/// Build the label set attached to a compute deployment.
///
/// The `app` label is unique per generation; the index label strips the
/// generation suffix and is stable across all generations of one pipeline.
pub fn deployment_labels(deployment: &str, generation: &str) -> BTreeMap<String, String> {
    let group = deployment
        .strip_suffix(generation)
        .and_then(|prefix| prefix.strip_suffix('-'))
        .unwrap_or(deployment);
    btreemap! {
        "app".into() => deployment.into(),
        LABEL_INDEX.into() => group.into(),
    }
}
