//! HTTP-backed capabilities: the schema registry and the search engine.
//!
//! Each instance owns its own client and connection configuration; nothing
//! here is process-wide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};

use crate::backends::{ArtifactMeta, RegistryApi, SearchApi};
use crate::config::Config;
use lodestone_core::{ReconcileError, ReconcileResult};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a wire-level client error into the reconcile error taxonomy.
fn classify(err: reqwest::Error, context: &str) -> ReconcileError {
    ReconcileError::Transient(format!("{}: {}", context, err))
}

/// Check a response status, draining the body into the error message on failure.
async fn check(resp: Response, context: &str) -> ReconcileResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = format!("{}: status {}: {}", context, status, body);
    if status == StatusCode::CONFLICT {
        Err(ReconcileError::Conflict(message))
    } else if status.is_client_error() {
        Err(ReconcileError::Validation(message))
    } else {
        Err(ReconcileError::Transient(message))
    }
}

fn build_client(context: &'static str) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(API_TIMEOUT)
        .build()
        .map_err(|err| anyhow::anyhow!("error building {} client: {}", context, err))
}

/// A `RegistryApi` implementation speaking the registry's REST API.
///
/// Value-schema subjects live under the compatibility API; GraphQL artifacts
/// live under the native artifacts API. The two namespaces are independent.
pub struct HttpRegistryApi {
    client: Client,
    config: Arc<Config>,
}

impl HttpRegistryApi {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        Ok(Self { client: build_client("schema registry")?, config })
    }

    fn subject_url(&self, rest: &str) -> String {
        format!("{}/ccompat/v6/subjects/{}", self.config.schema_registry_url, rest)
    }

    fn artifact_url(&self, rest: &str) -> String {
        format!("{}/registry/v2/groups/default/artifacts{}", self.config.schema_registry_url, rest)
    }
}

#[async_trait]
impl RegistryApi for HttpRegistryApi {
    #[tracing::instrument(level = "debug", skip(self, subject))]
    async fn subject_versions(&self, subject: &str) -> ReconcileResult<Vec<i64>> {
        let url = self.subject_url(&format!("{}/versions", subject));
        let resp = self.client.get(url).send().await.map_err(|err| classify(err, "error listing subject versions"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = check(resp, "error listing subject versions").await?;
        resp.json().await.map_err(|err| classify(err, "error decoding subject versions"))
    }

    #[tracing::instrument(level = "debug", skip(self, subject))]
    async fn latest_subject_version(&self, subject: &str) -> ReconcileResult<Option<String>> {
        let url = self.subject_url(&format!("{}/versions/latest", subject));
        let resp = self.client.get(url).send().await.map_err(|err| classify(err, "error fetching latest subject version"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp, "error fetching latest subject version").await?;
        let body: Value = resp.json().await.map_err(|err| classify(err, "error decoding latest subject version"))?;
        Ok(body["schema"].as_str().map(ToOwned::to_owned))
    }

    #[tracing::instrument(level = "debug", skip(self, subject, schema))]
    async fn register_subject_version(&self, subject: &str, schema: &str) -> ReconcileResult<i64> {
        tracing::info!(%subject, "registering value schema version");
        let url = self.subject_url(&format!("{}/versions", subject));
        let resp = self
            .client
            .post(url)
            .json(&json!({ "schema": schema }))
            .send()
            .await
            .map_err(|err| classify(err, "error registering subject version"))?;
        let resp = check(resp, "error registering subject version").await?;
        let body: Value = resp.json().await.map_err(|err| classify(err, "error decoding subject registration"))?;
        Ok(body["id"].as_i64().unwrap_or_default())
    }

    #[tracing::instrument(level = "debug", skip(self, subject))]
    async fn delete_subject(&self, subject: &str) -> ReconcileResult<()> {
        tracing::info!(%subject, "deleting value schema subject");
        let resp = self
            .client
            .delete(self.subject_url(subject))
            .send()
            .await
            .map_err(|err| classify(err, "error deleting subject"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp, "error deleting subject").await.map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, artifact))]
    async fn artifact_versions(&self, artifact: &str) -> ReconcileResult<Vec<i64>> {
        let url = self.artifact_url(&format!("/{}/versions", artifact));
        let resp = self.client.get(url).send().await.map_err(|err| classify(err, "error listing artifact versions"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = check(resp, "error listing artifact versions").await?;
        let body: Value = resp.json().await.map_err(|err| classify(err, "error decoding artifact versions"))?;
        let versions = body["versions"]
            .as_array()
            .map(|versions| {
                versions
                    .iter()
                    .filter_map(|version| {
                        version["version"]
                            .as_i64()
                            .or_else(|| version["version"].as_str().and_then(|raw| raw.parse().ok()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(versions)
    }

    #[tracing::instrument(level = "debug", skip(self, artifact, content))]
    async fn register_artifact(&self, artifact: &str, content: &str) -> ReconcileResult<()> {
        tracing::info!(%artifact, "registering graphql artifact");
        let resp = self
            .client
            .post(self.artifact_url(""))
            .header("X-Registry-ArtifactId", artifact)
            .header("X-Registry-ArtifactType", "GRAPHQL")
            .body(content.to_string())
            .send()
            .await
            .map_err(|err| classify(err, "error registering artifact"))?;
        check(resp, "error registering artifact").await.map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, artifact, meta))]
    async fn set_artifact_meta(&self, artifact: &str, meta: &ArtifactMeta) -> ReconcileResult<()> {
        let url = self.artifact_url(&format!("/{}/meta", artifact));
        let resp = self
            .client
            .put(url)
            .json(&json!({ "name": meta.name, "state": meta.state }))
            .send()
            .await
            .map_err(|err| classify(err, "error setting artifact metadata"))?;
        check(resp, "error setting artifact metadata").await.map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, artifact))]
    async fn delete_artifact(&self, artifact: &str) -> ReconcileResult<()> {
        tracing::info!(%artifact, "deleting graphql artifact");
        let resp = self
            .client
            .delete(self.artifact_url(&format!("/{}", artifact)))
            .send()
            .await
            .map_err(|err| classify(err, "error deleting artifact"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp, "error deleting artifact").await.map(|_| ())
    }
}

/// A `SearchApi` implementation speaking the search engine's REST API.
pub struct HttpSearchApi {
    client: Client,
    config: Arc<Config>,
}

impl HttpSearchApi {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        Ok(Self { client: build_client("search engine")?, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.elasticsearch_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.config.elasticsearch_username, Some(&self.config.elasticsearch_password))
    }
}

#[async_trait]
impl SearchApi for HttpSearchApi {
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn index_exists(&self, name: &str) -> ReconcileResult<bool> {
        let resp = self
            .request(reqwest::Method::HEAD, name)
            .send()
            .await
            .map_err(|err| classify(err, "error checking index existence"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp, "error checking index existence").await.map(|_| true)
    }

    #[tracing::instrument(level = "debug", skip(self, name, mapping))]
    async fn put_index(&self, name: &str, mapping: &Value) -> ReconcileResult<()> {
        tracing::info!(index = %name, "creating search index");
        let resp = self
            .request(reqwest::Method::PUT, name)
            .json(mapping)
            .send()
            .await
            .map_err(|err| classify(err, "error creating index"))?;
        check(resp, "error creating index").await.map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_index(&self, name: &str) -> ReconcileResult<()> {
        tracing::info!(index = %name, "deleting search index");
        let resp = self
            .request(reqwest::Method::DELETE, name)
            .send()
            .await
            .map_err(|err| classify(err, "error deleting index"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp, "error deleting index").await.map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn get_ingest_pipeline(&self, name: &str) -> ReconcileResult<Option<Value>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("_ingest/pipeline/{}", name))
            .send()
            .await
            .map_err(|err| classify(err, "error fetching ingest pipeline"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp, "error fetching ingest pipeline").await?;
        let mut body: Value = resp.json().await.map_err(|err| classify(err, "error decoding ingest pipeline"))?;
        Ok(body.get_mut(name).map(Value::take))
    }

    #[tracing::instrument(level = "debug", skip(self, name, body))]
    async fn put_ingest_pipeline(&self, name: &str, body: &Value) -> ReconcileResult<()> {
        tracing::info!(pipeline = %name, "writing ingest pipeline");
        let resp = self
            .request(reqwest::Method::PUT, &format!("_ingest/pipeline/{}", name))
            .json(body)
            .send()
            .await
            .map_err(|err| classify(err, "error writing ingest pipeline"))?;
        check(resp, "error writing ingest pipeline").await.map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn delete_ingest_pipeline(&self, name: &str) -> ReconcileResult<()> {
        tracing::info!(pipeline = %name, "deleting ingest pipeline");
        let resp = self
            .request(reqwest::Method::DELETE, &format!("_ingest/pipeline/{}", name))
            .send()
            .await
            .map_err(|err| classify(err, "error deleting ingest pipeline"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp, "error deleting ingest pipeline").await.map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, index))]
    async fn document_count(&self, index: &str) -> ReconcileResult<i64> {
        let resp = self
            .request(reqwest::Method::GET, &format!("{}/_count", index))
            .send()
            .await
            .map_err(|err| classify(err, "error counting documents"))?;
        let resp = check(resp, "error counting documents").await?;
        let body: Value = resp.json().await.map_err(|err| classify(err, "error decoding document count"))?;
        Ok(body["count"].as_i64().unwrap_or_default())
    }
}
