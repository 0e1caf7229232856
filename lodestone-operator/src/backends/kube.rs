//! Kubernetes-backed capabilities: compute deployments and the Strimzi
//! topic/connector custom resources of the message-log platform.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use maplit::btreemap;
use serde_json::json;
use tokio::time::timeout;

use crate::backends::{ComputeApi, ConnectorSpec, LogApi, TopicSpec};
use crate::config::Config;
use lodestone_core::{ReconcileError, ReconcileResult};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The field manager used for server-side apply.
const APP_NAME: &str = "lodestone-operator";
/// The label binding a topic or connector CR to its Connect cluster.
const LABEL_STRIMZI_CLUSTER: &str = "strimzi.io/cluster";

/// A `ComputeApi` implementation backed by the Kubernetes apps/v1 API.
pub struct KubeComputeApi {
    client: Client,
    config: Arc<Config>,
}

impl KubeComputeApi {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    fn api(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }
}

#[async_trait]
impl ComputeApi for KubeComputeApi {
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn get_deployment(&self, name: &str) -> ReconcileResult<Option<Deployment>> {
        let res = timeout(API_TIMEOUT, self.api().get(name))
            .await
            .map_err(|_| ReconcileError::transient("timeout while fetching Deployment"))?;
        match res {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(kube_classify(err, "error fetching Deployment")),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, deployment))]
    async fn apply_deployment(&self, deployment: &Deployment) -> ReconcileResult<()> {
        let name = deployment.metadata.name.as_deref().unwrap_or("");
        tracing::info!(%name, "applying Deployment");
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        let mut deployment = deployment.clone();
        deployment.metadata.managed_fields = None;
        timeout(API_TIMEOUT, self.api().patch(name, &params, &Patch::Apply(&deployment)))
            .await
            .map_err(|_| ReconcileError::transient("timeout while applying Deployment"))?
            .map_err(|err| kube_classify(err, "error applying Deployment"))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_deployment(&self, name: &str) -> ReconcileResult<()> {
        tracing::info!(%name, "deleting Deployment");
        let res = timeout(API_TIMEOUT, self.api().delete(name, &Default::default()))
            .await
            .map_err(|_| ReconcileError::transient("timeout while deleting Deployment"))?;
        match res {
            Ok(_val) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
            Err(err) => Err(kube_classify(err, "error deleting Deployment")),
        }
    }
}

/// A `LogApi` implementation backed by the Strimzi topic and connector CRs.
pub struct KubeLogApi {
    client: Client,
    config: Arc<Config>,
    topic_resource: ApiResource,
    connector_resource: ApiResource,
}

impl KubeLogApi {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        let topic_resource = ApiResource::from_gvk(&GroupVersionKind {
            group: "kafka.strimzi.io".into(),
            version: "v1beta2".into(),
            kind: "KafkaTopic".into(),
        });
        let connector_resource = ApiResource::from_gvk(&GroupVersionKind {
            group: "kafka.strimzi.io".into(),
            version: "v1beta2".into(),
            kind: "KafkaConnector".into(),
        });
        Self { client, config, topic_resource, connector_resource }
    }

    fn topics(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.config.namespace, &self.topic_resource)
    }

    fn connectors(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.config.namespace, &self.connector_resource)
    }

    async fn get_raw(&self, api: Api<DynamicObject>, name: &str, context: &str) -> ReconcileResult<Option<DynamicObject>> {
        let res = timeout(API_TIMEOUT, api.get(name))
            .await
            .map_err(|_| ReconcileError::transient(format!("timeout while fetching {}", context)))?;
        match res {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(kube_classify(err, context)),
        }
    }

    async fn apply_raw(&self, api: Api<DynamicObject>, obj: &DynamicObject, context: &str) -> ReconcileResult<()> {
        let name = obj.metadata.name.as_deref().unwrap_or("");
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true;
        timeout(API_TIMEOUT, api.patch(name, &params, &Patch::Apply(obj)))
            .await
            .map_err(|_| ReconcileError::transient(format!("timeout while applying {}", context)))?
            .map_err(|err| kube_classify(err, context))?;
        Ok(())
    }

    async fn delete_raw(&self, api: Api<DynamicObject>, name: &str, context: &str) -> ReconcileResult<()> {
        let res = timeout(API_TIMEOUT, api.delete(name, &Default::default()))
            .await
            .map_err(|_| ReconcileError::transient(format!("timeout while deleting {}", context)))?;
        match res {
            Ok(_val) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
            Err(err) => Err(kube_classify(err, context)),
        }
    }

    fn new_object(&self, name: &str, resource: &ApiResource) -> DynamicObject {
        let mut obj = DynamicObject::new(name, resource).within(&self.config.namespace);
        obj.metadata.labels = Some(btreemap! {
            LABEL_STRIMZI_CLUSTER.into() => self.config.connect_cluster.clone(),
        });
        obj
    }
}

#[async_trait]
impl LogApi for KubeLogApi {
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn get_topic(&self, name: &str) -> ReconcileResult<Option<TopicSpec>> {
        let obj = match self.get_raw(self.topics(), name, "error fetching topic").await? {
            Some(obj) => obj,
            None => return Ok(None),
        };
        let spec = &obj.data["spec"];
        let config = spec["config"]
            .as_object()
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| {
                        let value = value.as_str().map(ToOwned::to_owned).unwrap_or_else(|| value.to_string());
                        (key.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(TopicSpec {
            partitions: spec["partitions"].as_i64().unwrap_or_default() as i32,
            replication_factor: spec["replicas"].as_i64().unwrap_or_default() as i32,
            config,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, name, spec))]
    async fn put_topic(&self, name: &str, spec: &TopicSpec) -> ReconcileResult<()> {
        tracing::info!(topic = %name, "applying topic");
        let mut obj = self.new_object(name, &self.topic_resource);
        obj.data = json!({
            "spec": {
                "partitions": spec.partitions,
                "replicas": spec.replication_factor,
                "config": spec.config,
            }
        });
        self.apply_raw(self.topics(), &obj, "error applying topic").await
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_topic(&self, name: &str) -> ReconcileResult<()> {
        tracing::info!(topic = %name, "deleting topic");
        self.delete_raw(self.topics(), name, "error deleting topic").await
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn get_connector(&self, name: &str) -> ReconcileResult<Option<ConnectorSpec>> {
        let obj = match self.get_raw(self.connectors(), name, "error fetching connector").await? {
            Some(obj) => obj,
            None => return Ok(None),
        };
        let spec = &obj.data["spec"];
        Ok(Some(ConnectorSpec {
            class: spec["class"].as_str().unwrap_or_default().to_string(),
            pause: spec["pause"].as_bool().unwrap_or_default(),
            config: spec["config"].clone(),
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, name, spec))]
    async fn put_connector(&self, name: &str, spec: &ConnectorSpec) -> ReconcileResult<()> {
        tracing::info!(connector = %name, "applying connector");
        let mut obj = self.new_object(name, &self.connector_resource);
        obj.data = json!({
            "spec": {
                "class": spec.class,
                "pause": spec.pause,
                "tasksMax": 1,
                "config": spec.config,
            }
        });
        self.apply_raw(self.connectors(), &obj, "error applying connector").await
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_connector(&self, name: &str) -> ReconcileResult<()> {
        tracing::info!(connector = %name, "deleting connector");
        self.delete_raw(self.connectors(), name, "error deleting connector").await
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn connector_running(&self, name: &str) -> ReconcileResult<bool> {
        let obj = match self.get_raw(self.connectors(), name, "error fetching connector status").await? {
            Some(obj) => obj,
            None => return Ok(false),
        };
        let ready = obj.data["status"]["conditions"]
            .as_array()
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|condition| condition["type"] == "Ready" && condition["status"] == "True")
            })
            .unwrap_or(false);
        Ok(ready)
    }

    async fn connector_lag(&self, _name: &str) -> ReconcileResult<Option<i64>> {
        // The connector CR does not expose consumer lag; the gate is skipped
        // when the platform cannot report it.
        Ok(None)
    }
}

/// Classify a raw client error into the reconcile error taxonomy.
pub(crate) fn kube_classify(err: kube::Error, context: &str) -> ReconcileError {
    match err {
        kube::Error::Api(api_err) if api_err.code == http::StatusCode::CONFLICT => {
            ReconcileError::Conflict(format!("{}: {}", context, api_err.message))
        }
        kube::Error::Api(api_err) if (400..500).contains(&api_err.code) => {
            ReconcileError::Validation(format!("{}: {}", context, api_err.message))
        }
        err => ReconcileError::Transient(format!("{}: {}", context, err)),
    }
}
