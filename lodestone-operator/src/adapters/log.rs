//! The message-log adapter: sink topic and sink connector.

use std::sync::Arc;

use maplit::btreemap;
use serde_json::json;

use crate::backends::{ConnectorSpec, HealthStatus, LogApi, TopicSpec};
use crate::config::Config;
use crate::names::NameSet;
use lodestone_core::crd::IndexPipeline;
use lodestone_core::schema::ValueSchema;
use lodestone_core::ReconcileResult;

/// The connector class used for search sink connectors.
const SINK_CONNECTOR_CLASS: &str = "io.confluent.connect.elasticsearch.ElasticsearchSinkConnector";

/// Adapter reconciling the topic and connector owned by a generation.
#[derive(Clone)]
pub struct LogAdapter {
    api: Arc<dyn LogApi>,
    config: Arc<Config>,
}

impl LogAdapter {
    /// Create a new instance.
    pub fn new(api: Arc<dyn LogApi>, config: Arc<Config>) -> Self {
        Self { api, config }
    }

    /// Reconcile the generation's sink topic to its desired spec.
    #[tracing::instrument(level = "debug", skip(self, pipeline, names))]
    pub async fn reconcile_topic(&self, pipeline: &IndexPipeline, names: &NameSet) -> ReconcileResult<()> {
        let desired = self.topic_spec(pipeline);
        match self.api.get_topic(&names.topic).await? {
            Some(current) if current == desired => Ok(()),
            _ => self.api.put_topic(&names.topic, &desired).await,
        }
    }

    /// Reconcile the generation's sink connector to its desired spec.
    #[tracing::instrument(level = "debug", skip(self, pipeline, names, schema))]
    pub async fn reconcile_connector(&self, pipeline: &IndexPipeline, names: &NameSet, schema: &ValueSchema) -> ReconcileResult<()> {
        let desired = self.connector_spec(pipeline, names, schema);
        match self.api.get_connector(&names.connector).await? {
            Some(current) if current == desired => Ok(()),
            _ => self.api.put_connector(&names.connector, &desired).await,
        }
    }

    /// Delete the generation's connector; absence is success.
    pub async fn delete_connector(&self, names: &NameSet) -> ReconcileResult<()> {
        self.api.delete_connector(&names.connector).await
    }

    /// Delete the generation's topic; absence is success.
    pub async fn delete_topic(&self, names: &NameSet) -> ReconcileResult<()> {
        self.api.delete_topic(&names.topic).await
    }

    /// Observe the health of the topic and connector.
    #[tracing::instrument(level = "debug", skip(self, names))]
    pub async fn read_health(&self, names: &NameSet) -> ReconcileResult<Vec<(String, HealthStatus)>> {
        let topic = match self.api.get_topic(&names.topic).await? {
            Some(_) => HealthStatus::Healthy,
            None => HealthStatus::Missing,
        };
        let connector = match self.api.get_connector(&names.connector).await? {
            None => HealthStatus::Missing,
            Some(_) => {
                if self.api.connector_running(&names.connector).await? {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Pending("connector tasks are not running".into())
                }
            }
        };
        Ok(vec![(names.topic.clone(), topic), (names.connector.clone(), connector)])
    }

    /// Total consumer lag of the sink connector, when the platform reports it.
    pub async fn connector_lag(&self, names: &NameSet) -> ReconcileResult<Option<i64>> {
        self.api.connector_lag(&names.connector).await
    }

    fn topic_spec(&self, pipeline: &IndexPipeline) -> TopicSpec {
        let params = pipeline.spec.topic.clone().unwrap_or_default();
        TopicSpec {
            partitions: params.partitions,
            replication_factor: params.replication_factor,
            config: btreemap! {
                "retention.ms".into() => params.retention_ms.to_string(),
            },
        }
    }

    fn connector_spec(&self, pipeline: &IndexPipeline, names: &NameSet, schema: &ValueSchema) -> ConnectorSpec {
        ConnectorSpec {
            class: SINK_CONNECTOR_CLASS.into(),
            pause: pipeline.spec.pause,
            config: json!({
                "topics": names.topic,
                "connection.url": self.config.elasticsearch_url,
                "connection.username": self.config.elasticsearch_username,
                "connection.password": self.config.elasticsearch_password,
                "index": names.index,
                "key.ignore": "false",
                "behavior.on.null.values": "delete",
                "value.converter.schema.registry.url": self.config.schema_registry_url,
                "value.schema": schema.avro_json(),
            }),
        }
    }
}
