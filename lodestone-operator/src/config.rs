//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `tracing` EnvFilter directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The Kubernetes namespace in which this operator manages resources.
    pub namespace: String,

    /// Bootstrap address of the message-log cluster.
    pub kafka_bootstrap: String,
    /// Name of the Connect cluster which owns sink connectors.
    #[serde(default = "Config::default_connect_cluster")]
    pub connect_cluster: String,
    /// Base URL of the schema registry API.
    pub schema_registry_url: String,
    /// Protocol used by subgraph deployments to reach the schema registry.
    pub schema_registry_protocol: String,
    /// Hostname used by subgraph deployments to reach the schema registry.
    pub schema_registry_hostname: String,
    /// Port used by subgraph deployments to reach the schema registry.
    pub schema_registry_port: u16,
    /// Base URL of the search cluster.
    pub elasticsearch_url: String,
    /// Username used when connecting to the search cluster.
    pub elasticsearch_username: String,
    /// Password used when connecting to the search cluster.
    pub elasticsearch_password: String,

    /// Container image used for core compute deployments.
    pub core_image: String,
    /// Container image used for the generic API subgraph deployment.
    pub subgraph_image: String,

    /// Seconds for which a demoted Standby generation is retained before
    /// teardown. When unset, Standby generations are retained indefinitely.
    #[serde(default)]
    pub standby_ttl_seconds: Option<u64>,
    /// Materialization attempts allowed per generation before a consistency
    /// violation is reported and retries stop.
    #[serde(default = "Config::default_max_materialize_attempts")]
    pub max_materialize_attempts: u32,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_rust_log() -> String {
        "error,lodestone_operator=info".into()
    }

    fn default_connect_cluster() -> String {
        "connect".into()
    }

    fn default_max_materialize_attempts() -> u32 {
        5
    }

    /// Create a config instance for use in testing.
    #[cfg(test)]
    pub fn new_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            rust_log: Self::default_rust_log(),
            namespace: "default".into(),
            kafka_bootstrap: "localhost:9092".into(),
            connect_cluster: "connect".into(),
            schema_registry_url: "http://registry.test.svc:8080/apis".into(),
            schema_registry_protocol: "http".into(),
            schema_registry_hostname: "registry.test.svc".into(),
            schema_registry_port: 8080,
            elasticsearch_url: "http://localhost:9200".into(),
            elasticsearch_username: "lodestone".into(),
            elasticsearch_password: "lodestone1337".into(),
            core_image: "quay.io/lodestone/core:latest".into(),
            subgraph_image: "quay.io/lodestone/api-subgraph:latest".into(),
            standby_ttl_seconds: None,
            max_materialize_attempts: 5,
        })
    }
}
