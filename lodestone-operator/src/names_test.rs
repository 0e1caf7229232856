use std::collections::HashSet;

use lodestone_core::crd::CustomSubgraphImage;

use crate::names::{deployment_labels, NameSet, LABEL_INDEX};

fn subgraph(name: &str, image: &str) -> CustomSubgraphImage {
    CustomSubgraphImage { name: name.into(), image: image.into() }
}

#[test]
fn primary_artifacts_share_the_dotted_name() {
    let names = NameSet::derive("p1", "g1", &[]);
    assert_eq!(names.topic, "indexpipeline.p1.g1");
    assert_eq!(names.connector, "indexpipeline.p1.g1");
    assert_eq!(names.index, "indexpipeline.p1.g1");
    assert_eq!(names.ingest_pipeline, "indexpipeline.p1.g1");
    assert_eq!(names.graphql_schema, "indexpipeline.p1.g1");
    assert_eq!(names.value_schema_subject, "indexpipeline.p1.g1-value");
}

#[test]
fn deployment_names_are_dash_joined() {
    let names = NameSet::derive("p1", "g1", &[subgraph("x1", "quay.io/lodestone/x1:latest")]);
    assert_eq!(names.core_deployment, "lodestone-core-indexpipeline-p1-g1");
    assert_eq!(names.subgraph_deployment, "indexpipeline-p1-g1");
    assert_eq!(names.custom_subgraphs.len(), 1, "expected one custom subgraph name set");
    assert_eq!(names.custom_subgraphs[0].deployment, "indexpipeline-p1-x1-g1");
    assert_eq!(names.custom_subgraphs[0].graphql_schema, "indexpipeline.p1-x1.g1");
}

#[test]
fn distinct_generations_produce_disjoint_name_sets() {
    let subgraphs = vec![subgraph("x1", "quay.io/lodestone/x1:latest")];
    let g1 = NameSet::derive("p1", "g1", &subgraphs);
    let g2 = NameSet::derive("p1", "g2", &subgraphs);
    let g1_names: HashSet<&str> = g1.all().into_iter().collect();
    for name in g2.all() {
        assert!(!g1_names.contains(name), "name `{}` is shared between generations", name);
    }
}

#[test]
fn distinct_pipelines_produce_disjoint_name_sets() {
    let g1 = NameSet::derive("p1", "g1", &[]);
    let other = NameSet::derive("p2", "g1", &[]);
    let g1_names: HashSet<&str> = g1.all().into_iter().collect();
    for name in other.all() {
        assert!(!g1_names.contains(name), "name `{}` is shared between pipelines", name);
    }
}

#[test]
fn labels_group_generations_of_one_pipeline() {
    let g1 = deployment_labels("lodestone-core-indexpipeline-p1-g1", "g1");
    let g2 = deployment_labels("lodestone-core-indexpipeline-p1-g2", "g2");
    assert_eq!(g1.get("app").map(String::as_str), Some("lodestone-core-indexpipeline-p1-g1"));
    assert_eq!(g1.get(LABEL_INDEX), g2.get(LABEL_INDEX), "expected the index label to be stable across generations");
    assert_eq!(g1.get(LABEL_INDEX).map(String::as_str), Some("lodestone-core-indexpipeline-p1"));
    assert_ne!(g1.get("app"), g2.get("app"), "expected the app label to be unique per generation");
}
