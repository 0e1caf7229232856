//! The compute adapter: the core process deployment and the API subgraph
//! deployments of a generation.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;

use crate::backends::{ComputeApi, HealthStatus};
use crate::config::Config;
use crate::names::{deployment_labels, NameSet};
use lodestone_core::crd::IndexPipeline;
use lodestone_core::schema::ValueSchema;
use lodestone_core::ReconcileResult;

/// The container port published by API subgraph deployments.
const SUBGRAPH_PORT_WEB: i32 = 8000;

/// Adapter reconciling the compute deployments owned by a generation.
#[derive(Clone)]
pub struct ComputeAdapter {
    api: Arc<dyn ComputeApi>,
    config: Arc<Config>,
}

impl ComputeAdapter {
    /// Create a new instance.
    pub fn new(api: Arc<dyn ComputeApi>, config: Arc<Config>) -> Self {
        Self { api, config }
    }

    /// Reconcile every deployment of the generation to its desired spec.
    #[tracing::instrument(level = "debug", skip(self, pipeline, names, schema))]
    pub async fn reconcile(&self, pipeline: &IndexPipeline, names: &NameSet, schema: &ValueSchema) -> ReconcileResult<()> {
        for deployment in self.build_deployments(pipeline, names, schema) {
            self.apply(deployment).await?;
        }
        Ok(())
    }

    /// Delete every deployment of the generation; absence is success.
    #[tracing::instrument(level = "debug", skip(self, names))]
    pub async fn delete(&self, names: &NameSet) -> ReconcileResult<()> {
        for subgraph in &names.custom_subgraphs {
            self.api.delete_deployment(&subgraph.deployment).await?;
        }
        self.api.delete_deployment(&names.subgraph_deployment).await?;
        self.api.delete_deployment(&names.core_deployment).await
    }

    /// Observe the readiness of every deployment of the generation.
    #[tracing::instrument(level = "debug", skip(self, names))]
    pub async fn read_health(&self, names: &NameSet) -> ReconcileResult<Vec<(String, HealthStatus)>> {
        let mut deployments = vec![names.core_deployment.clone(), names.subgraph_deployment.clone()];
        deployments.extend(names.custom_subgraphs.iter().map(|subgraph| subgraph.deployment.clone()));
        let mut members = Vec::new();
        for name in deployments {
            let status = match self.api.get_deployment(&name).await? {
                None => HealthStatus::Missing,
                Some(deployment) => {
                    let desired = deployment.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
                    let ready = deployment.status.as_ref().and_then(|status| status.ready_replicas).unwrap_or(0);
                    if ready >= desired {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Pending(format!("{}/{} replicas ready", ready, desired))
                    }
                }
            };
            members.push((name, status));
        }
        Ok(members)
    }

    /// Apply a deployment when its desired spec differs from the current one.
    async fn apply(&self, desired: Deployment) -> ReconcileResult<()> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        match self.api.get_deployment(&name).await? {
            Some(current) if current.spec == desired.spec => Ok(()),
            _ => self.api.apply_deployment(&desired).await,
        }
    }

    fn build_deployments(&self, pipeline: &IndexPipeline, names: &NameSet, schema: &ValueSchema) -> Vec<Deployment> {
        let mut deployments = vec![self.build_core_deployment(pipeline, names, schema)];
        deployments.push(self.build_subgraph_deployment(&names.subgraph_deployment, &self.config.subgraph_image, &names.graphql_schema, names, schema));
        for subgraph in &names.custom_subgraphs {
            deployments.push(self.build_subgraph_deployment(&subgraph.deployment, &subgraph.image, &subgraph.graphql_schema, names, schema));
        }
        deployments
    }

    /// Build the core process deployment for the generation.
    fn build_core_deployment(&self, pipeline: &IndexPipeline, names: &NameSet, schema: &ValueSchema) -> Deployment {
        let source_topics = pipeline
            .spec
            .sources
            .iter()
            .map(|source| source.topic.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let env = vec![
            env_var("SOURCE_TOPICS", source_topics),
            env_var("SINK_TOPIC", &names.topic),
            env_var("SCHEMA_REGISTRY_URL", &self.config.schema_registry_url),
            env_var("KAFKA_BOOTSTRAP", &self.config.kafka_bootstrap),
            env_var("SINK_SCHEMA", schema.avro_json()),
        ];
        self.build_deployment(&names.core_deployment, &self.config.core_image, &names.generation, env, None)
    }

    /// Build an API subgraph deployment for the generation.
    fn build_subgraph_deployment(&self, name: &str, image: &str, graphql_schema: &str, names: &NameSet, schema: &ValueSchema) -> Deployment {
        let env = vec![
            env_var("AVRO_SCHEMA", schema.avro_json()),
            env_var("SCHEMA_REGISTRY_PROTOCOL", &self.config.schema_registry_protocol),
            env_var("SCHEMA_REGISTRY_HOSTNAME", &self.config.schema_registry_hostname),
            env_var("SCHEMA_REGISTRY_PORT", self.config.schema_registry_port.to_string()),
            env_var("ELASTIC_SEARCH_URL", &self.config.elasticsearch_url),
            env_var("ELASTIC_SEARCH_USERNAME", &self.config.elasticsearch_username),
            env_var("ELASTIC_SEARCH_PASSWORD", &self.config.elasticsearch_password),
            env_var("ELASTIC_SEARCH_INDEX", &names.index),
            env_var("GRAPHQL_SCHEMA_NAME", graphql_schema),
        ];
        let port = ContainerPort {
            name: Some("web".into()),
            container_port: SUBGRAPH_PORT_WEB,
            protocol: Some("TCP".into()),
            ..Default::default()
        };
        self.build_deployment(name, image, &names.generation, env, Some(port))
    }

    /// Build a deployment with the rolling-update policy shared by every
    /// compute member of a generation.
    fn build_deployment(&self, name: &str, image: &str, generation: &str, env: Vec<EnvVar>, port: Option<ContainerPort>) -> Deployment {
        let labels = deployment_labels(name, generation);

        // Build metadata.
        let mut deployment = Deployment::default();
        deployment.meta_mut().name = Some(name.to_string());
        deployment.meta_mut().namespace = Some(self.config.namespace.clone());
        deployment.meta_mut().labels = Some(labels.clone());

        // Build spec.
        deployment.spec = Some(DeploymentSpec {
            replicas: Some(1),
            revision_history_limit: Some(10),
            progress_deadline_seconds: Some(600),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".into()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("25%".into())),
                    max_unavailable: Some(IntOrString::String("25%".into())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("IfNotPresent".into()),
                        env: Some(env),
                        ports: port.map(|port| vec![port]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        });

        deployment
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.into(), value: Some(value.into()), ..Default::default() }
}
