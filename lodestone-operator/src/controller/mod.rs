//! Lifecycle controller for IndexPipeline custom resources.
//!
//! One reconcile pass runs to completion per pipeline event; passes for the
//! same pipeline are never interleaved because all tasks drain through a
//! single consumer loop. The store's conflict-checked status update is the
//! serialization point for everything the controller writes: a pass which
//! loses a race re-reads state and retries instead of double-creating
//! resources. Validation polling is achieved by re-queuing the same event
//! with a delay rather than spawning timer tasks, which keeps all version
//! state mutation confined to the reconcile execution context.

mod store;


use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::prelude::*;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use kube::Resource;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::adapters::{ComputeAdapter, LogAdapter, RegistryAdapter, SearchAdapter};
use crate::backends::{HttpRegistryApi, HttpSearchApi, KubeComputeApi, KubeLogApi};
use crate::config::Config;
use crate::sync::GenerationSynchronizer;
use crate::tracker::VersionStateTracker;
use lodestone_core::crd::{IndexPipeline, IndexPipelineStatus, PipelineVersion, RequiredMetadata, StatusCondition, VersionState};
use lodestone_core::{ReconcileError, ReconcileResult};

pub use store::{KubePipelineStore, PipelineStore, FINALIZER};

/// The timeout duration used before rescheduling a failed reconcile.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);
/// The delay between validation polls of an unconfirmed generation.
const VALIDATION_POLL_DELAY: Duration = Duration::from_secs(10);
/// Cap applied to the exponential retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// The condition type reporting the most recent reconcile failure.
const CONDITION_RECONCILE_FAILED: &str = "ReconcileFailed";
/// The condition type reporting an active, serving generation.
const CONDITION_AVAILABLE: &str = "Available";

type EventResult = std::result::Result<Event<IndexPipeline>, WatcherError>;

/// The outcome of one reconcile pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing further to do until the next change event.
    Done,
    /// Re-queue the same pipeline after the given delay.
    Requeue(Duration),
}

impl Outcome {
    /// Combine two outcomes, keeping the sooner re-queue.
    fn sooner(self, other: Self) -> Self {
        match (self, other) {
            (Self::Done, other) => other,
            (this, Self::Done) => this,
            (Self::Requeue(a), Self::Requeue(b)) => Self::Requeue(a.min(b)),
        }
    }
}

/// Mint a new generation token.
///
/// Tokens are strictly monotonic within the process and never reused, so two
/// generations minted within the same millisecond still get distinct tokens.
/// Uniqueness against concurrent reconciles of the same pipeline is upheld by
/// the store's conflict-checked status update, not by the token itself.
pub fn mint_generation() -> String {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let mut candidate = Utc::now().timestamp_millis();
    loop {
        let last = LAST.load(Ordering::SeqCst);
        if candidate <= last {
            candidate = last + 1;
        }
        if LAST.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            return candidate.to_string();
        }
    }
}

/// Hash the pipeline definition to detect spec changes across generations.
fn spec_hash(spec: &lodestone_core::crd::IndexPipelineSpec) -> String {
    let encoded = serde_json::to_vec(spec).unwrap_or_default();
    format!("{:016x}", seahash::hash(&encoded))
}

/// Exponential backoff for materialization retries.
fn backoff(attempts: u32) -> Duration {
    let exp = attempts.min(16);
    (RESCHEDULE_TIMEOUT * 2u32.saturating_pow(exp)).min(MAX_BACKOFF)
}

fn failed_condition(err: &ReconcileError) -> StatusCondition {
    StatusCondition {
        type_: CONDITION_RECONCILE_FAILED.into(),
        status: "True".into(),
        reason: Some(err.reason().into()),
        message: Some(err.to_string()),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// The reconcile state machine, invoked once per event for a single pipeline.
pub struct Reconciler {
    config: Arc<Config>,
    store: Arc<dyn PipelineStore>,
    sync: GenerationSynchronizer,
    tracker: VersionStateTracker,
}

impl Reconciler {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: Arc<dyn PipelineStore>, sync: GenerationSynchronizer, tracker: VersionStateTracker) -> Self {
        Self { config, store, sync, tracker }
    }

    /// Run one reconcile pass for the named pipeline.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn reconcile(&self, name: &str) -> ReconcileResult<Outcome> {
        let pipeline = match self.store.get(name).await? {
            Some(pipeline) => pipeline,
            None => return Ok(Outcome::Done),
        };

        // Deletion always takes precedence over creation and promotion.
        if pipeline.meta().deletion_timestamp.is_some() {
            return self.teardown_pipeline(pipeline).await;
        }

        if self.store.ensure_finalizer(&pipeline).await? {
            tracing::info!(pipeline = %name, "attached finalizer");
            return Ok(Outcome::Requeue(Duration::ZERO));
        }

        let mut pipeline = pipeline;
        let mut status = pipeline.status.clone().unwrap_or_default();
        let mut outcome = Outcome::Done;
        let current_hash = spec_hash(&pipeline.spec);

        // Mint a generation when no live one materializes the current spec —
        // both on first sight of a pipeline and after a definition change
        // (the replacement generation drives the blue/green swap). The status
        // write is the serialization point: a concurrent pass that lost the
        // race gets a conflict, re-reads, and finds the generation already
        // minted.
        if !status.has_current_version(&current_hash) {
            let generation = mint_generation();
            tracing::info!(pipeline = %name, %generation, "minting new generation");
            status.versions.push(PipelineVersion::new(generation.as_str(), current_hash.as_str()));
            pipeline = self.store.update_status(&pipeline, &status).await?;
        }

        // Materialize and validate the unconfirmed generation of the current
        // spec. Unconfirmed generations of superseded specs are left alone;
        // they are demoted at the next promotion.
        let unconfirmed = status
            .versions
            .iter()
            .find(|version| version.state == VersionState::New && version.spec_hash == current_hash)
            .cloned();
        if let Some(version) = unconfirmed {
            outcome = outcome.sooner(self.advance_new_version(&mut pipeline, &mut status, version).await?);
        }

        // Self-heal drift on the active generation.
        if let Some(active) = status.active_generation.clone() {
            if let Err(err) = self.sync.materialize(&pipeline, &active).await {
                if matches!(err, ReconcileError::Conflict(_)) {
                    return Err(err);
                }
                tracing::error!(error = %err, pipeline = %name, generation = %active, "error re-reconciling active generation");
                status.set_condition(failed_condition(&err));
                pipeline = self.store.update_status(&pipeline, &status).await?;
                outcome = outcome.sooner(Outcome::Requeue(RESCHEDULE_TIMEOUT));
            }
        }

        // Age out standby generations per the configured TTL.
        if let Some(ttl) = self.config.standby_ttl_seconds {
            outcome = outcome.sooner(self.age_out_standbys(&mut pipeline, &mut status, ttl).await?);
        }

        Ok(outcome)
    }

    /// Drive one `New` generation toward promotion.
    async fn advance_new_version(
        &self, pipeline: &mut IndexPipeline, status: &mut IndexPipelineStatus, version: PipelineVersion,
    ) -> ReconcileResult<Outcome> {
        let generation = version.generation.clone();
        if version.attempts >= self.config.max_materialize_attempts {
            // The consistency violation has already been reported; operator
            // intervention or a spec change is required to make progress.
            return Ok(Outcome::Done);
        }

        match self.sync.materialize(pipeline, &generation).await {
            Ok(()) => (),
            Err(err @ ReconcileError::Validation(_)) => {
                tracing::error!(error = %err, generation = %generation, "generation rejected by backend");
                return self.record_failure(pipeline, status, &generation, err, Outcome::Done).await;
            }
            Err(ReconcileError::Transient(message)) => {
                let attempts = version.attempts + 1;
                if attempts >= self.config.max_materialize_attempts {
                    let err = ReconcileError::ConsistencyViolation { attempts, message };
                    tracing::error!(error = %err, generation = %generation, "materialization retry budget exhausted");
                    return self.record_failure(pipeline, status, &generation, err, Outcome::Done).await;
                }
                let err = ReconcileError::Transient(message);
                tracing::warn!(error = %err, generation = %generation, "transient failure materializing generation");
                return self.record_failure(pipeline, status, &generation, err, Outcome::Requeue(backoff(attempts))).await;
            }
            // Conflicts bubble up so the runner re-reads and retries the pass.
            Err(err) => return Err(err),
        }

        // Materialized; poll downstream health to decide promotion.
        let health = self.tracker.evaluate(pipeline, &generation).await?;
        if !health.is_valid() {
            let summary = health.summary();
            tracing::debug!(generation = %generation, %summary, "generation not yet valid");
            if let Some(tracked) = status.version_mut(&generation) {
                tracked.message = Some(summary);
            }
            *pipeline = self.store.update_status(pipeline, status).await?;
            return Ok(Outcome::Requeue(VALIDATION_POLL_DELAY));
        }

        // Every member is healthy: the generation is valid, and a valid
        // generation is promoted immediately. The prior active generation is
        // demoted to standby with its resource set left materialized and
        // untouched; so is any other live generation of a superseded spec.
        if let Some(tracked) = status.version_mut(&generation) {
            tracked.state = VersionState::Valid;
            tracked.message = None;
        }
        let now = Utc::now().to_rfc3339();
        for tracked in status.versions.iter_mut() {
            if tracked.generation == generation {
                continue;
            }
            if matches!(tracked.state, VersionState::New | VersionState::Valid | VersionState::Active) {
                tracked.state = VersionState::Standby;
                tracked.demoted_at = Some(now.clone());
            }
        }
        if let Some(tracked) = status.version_mut(&generation) {
            tracked.state = VersionState::Active;
        }
        status.active_generation = Some(generation.clone());
        status.clear_condition(CONDITION_RECONCILE_FAILED);
        status.set_condition(StatusCondition {
            type_: CONDITION_AVAILABLE.into(),
            status: "True".into(),
            reason: Some("GenerationPromoted".into()),
            message: Some(format!("generation {} is active", generation)),
            last_transition_time: Some(now),
        });
        tracing::info!(pipeline = pipeline.name(), %generation, "promoted generation to active");
        *pipeline = self.store.update_status(pipeline, status).await?;
        Ok(Outcome::Done)
    }

    /// Record a failure in status before returning; no failure is silently
    /// swallowed.
    async fn record_failure(
        &self, pipeline: &mut IndexPipeline, status: &mut IndexPipelineStatus, generation: &str, err: ReconcileError, outcome: Outcome,
    ) -> ReconcileResult<Outcome> {
        if let Some(tracked) = status.version_mut(generation) {
            tracked.attempts += 1;
            tracked.message = Some(err.to_string());
        }
        status.set_condition(failed_condition(&err));
        *pipeline = self.store.update_status(pipeline, status).await?;
        Ok(outcome)
    }

    /// Tear down every generation of a pipeline marked for deletion, then
    /// release the finalizer once the last one is removed.
    #[tracing::instrument(level = "debug", skip(self, pipeline), fields(pipeline = pipeline.name()))]
    async fn teardown_pipeline(&self, mut pipeline: IndexPipeline) -> ReconcileResult<Outcome> {
        let mut status = pipeline.status.clone().unwrap_or_default();
        let targets: Vec<String> = status
            .versions
            .iter()
            .filter(|version| version.state != VersionState::Removed)
            .map(|version| version.generation.clone())
            .collect();

        let first_error = self.teardown_versions(&mut pipeline, &mut status, &targets).await?;
        if let Some(err) = first_error {
            status.set_condition(failed_condition(&err));
            pipeline = self.store.update_status(&pipeline, &status).await?;
            return Ok(Outcome::Requeue(RESCHEDULE_TIMEOUT));
        }

        self.store.remove_finalizer(&pipeline).await?;
        tracing::info!(pipeline = pipeline.name(), "teardown complete, finalizer released");
        Ok(Outcome::Done)
    }

    /// Tear down the managed resource sets of the given generations, tracking
    /// each as `Removing` before any delete is issued and as `Removed` once
    /// its teardown completes. Returns the first error encountered; the
    /// remaining generations are still attempted.
    async fn teardown_versions(
        &self, pipeline: &mut IndexPipeline, status: &mut IndexPipelineStatus, generations: &[String],
    ) -> ReconcileResult<Option<ReconcileError>> {
        let mut changed = false;
        for generation in generations {
            if let Some(version) = status.version_mut(generation) {
                if !matches!(version.state, VersionState::Removing | VersionState::Removed) {
                    version.state = VersionState::Removing;
                    changed = true;
                }
            }
        }
        if status
            .active_generation
            .as_ref()
            .map(|active| generations.contains(active))
            .unwrap_or(false)
        {
            status.active_generation = None;
            changed = true;
        }
        if changed {
            *pipeline = self.store.update_status(pipeline, status).await?;
        }

        let mut first_error = None;
        for generation in generations {
            if status.version(generation).map(|version| version.state) != Some(VersionState::Removing) {
                continue;
            }
            match self.sync.teardown(pipeline, generation).await {
                Ok(()) => {
                    if let Some(version) = status.version_mut(generation) {
                        version.state = VersionState::Removed;
                        version.message = None;
                    }
                    tracing::info!(pipeline = pipeline.name(), %generation, "generation removed");
                }
                Err(err) => {
                    tracing::error!(error = %err, pipeline = pipeline.name(), %generation, "error tearing down generation");
                    if let Some(version) = status.version_mut(generation) {
                        version.message = Some(err.to_string());
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        *pipeline = self.store.update_status(pipeline, status).await?;
        Ok(first_error)
    }

    /// Tear down standby generations whose transition window has elapsed.
    async fn age_out_standbys(&self, pipeline: &mut IndexPipeline, status: &mut IndexPipelineStatus, ttl: u64) -> ReconcileResult<Outcome> {
        let now = Utc::now();
        let expired: Vec<String> = status
            .versions
            .iter()
            .filter(|version| version.state == VersionState::Standby)
            .filter(|version| {
                version
                    .demoted_at
                    .as_deref()
                    .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                    .map(|demoted| now.signed_duration_since(demoted) >= chrono::Duration::seconds(ttl as i64))
                    .unwrap_or(false)
            })
            .map(|version| version.generation.clone())
            .collect();
        if expired.is_empty() {
            return Ok(Outcome::Done);
        }

        tracing::info!(pipeline = pipeline.name(), expired = ?expired, "standby transition window elapsed");
        match self.teardown_versions(pipeline, status, &expired).await? {
            None => Ok(Outcome::Done),
            Some(err) => {
                tracing::error!(error = %err, pipeline = pipeline.name(), "error aging out standby generations");
                Ok(Outcome::Requeue(RESCHEDULE_TIMEOUT))
            }
        }
    }
}

/// Kubernetes controller watching IndexPipeline CRs and driving reconciles.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The reconcile state machine.
    reconciler: Arc<Reconciler>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A channel of reconcile tasks.
    tasks_tx: mpsc::Sender<Arc<String>>,
    /// A channel of reconcile tasks.
    tasks_rx: ReceiverStream<Arc<String>>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let store = Arc::new(KubePipelineStore::new(client.clone(), config.clone()));
        let log = LogAdapter::new(Arc::new(KubeLogApi::new(client.clone(), config.clone())), config.clone());
        let registry = RegistryAdapter::new(Arc::new(HttpRegistryApi::new(config.clone())?));
        let search = SearchAdapter::new(Arc::new(HttpSearchApi::new(config.clone())?));
        let compute = ComputeAdapter::new(Arc::new(KubeComputeApi::new(client.clone(), config.clone())), config.clone());

        let sync = GenerationSynchronizer::new(log.clone(), registry.clone(), search.clone(), compute.clone());
        let tracker = VersionStateTracker::new(log, registry, search, compute);
        let reconciler = Arc::new(Reconciler::new(config.clone(), store, sync, tracker));

        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Ok(Self {
            client,
            config,
            reconciler,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let pipelines: Api<IndexPipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pipelines_watcher = watcher(pipelines, ListParams::default());
        tokio::pin!(pipelines_watcher);

        tracing::info!("lifecycle controller initialized");
        loop {
            tokio::select! {
                Some(event_res) = pipelines_watcher.next() => self.handle_pipeline_event(event_res),
                Some(name) = self.tasks_rx.next() => self.run_reconcile(name).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("lifecycle controller shutdown");
        Ok(())
    }

    /// Handle an `IndexPipeline` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    fn handle_pipeline_event(&mut self, res: EventResult) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from IndexPipeline k8s watcher");
                return;
            }
        };
        match event {
            Event::Applied(pipeline) => self.enqueue(&pipeline),
            // Deletion events only fire once the finalizer has been released,
            // at which point there is nothing left to reconcile.
            Event::Deleted(_pipeline) => (),
            Event::Restarted(pipelines) => {
                for pipeline in &pipelines {
                    self.enqueue(pipeline);
                }
            }
        }
    }

    fn enqueue(&self, pipeline: &IndexPipeline) {
        let name = match pipeline.meta().name.as_ref() {
            Some(name) => Arc::new(name.clone()),
            None => return, // Not actually possible as K8s requires name.
        };
        self.spawn_task(name, Duration::ZERO);
    }

    /// Run one reconcile pass, re-queuing per its outcome.
    #[tracing::instrument(level = "debug", skip(self, name))]
    async fn run_reconcile(&mut self, name: Arc<String>) {
        match self.reconciler.reconcile(&name).await {
            Ok(Outcome::Done) => (),
            Ok(Outcome::Requeue(delay)) => self.spawn_task(name, delay),
            Err(err @ ReconcileError::Conflict(_)) => {
                tracing::debug!(error = %err, pipeline = %name, "stale pipeline state, re-reading");
                self.spawn_task(name, Duration::ZERO);
            }
            Err(err) => {
                tracing::error!(error = %err, pipeline = %name, "error reconciling pipeline");
                self.spawn_task(name, RESCHEDULE_TIMEOUT);
            }
        }
    }

    /// Spawn a task which re-emits the given reconcile task after a delay.
    ///
    /// This indirection is used to ensure that we don't use an unlimited
    /// amount of memory with an unbounded queue, and also so that we do not
    /// block the controller from making progress and dead-locking when we
    /// hit the task queue cap.
    fn spawn_task(&self, name: Arc<String>, delay: Duration) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _res = tx.send(name).await;
        });
    }
}
