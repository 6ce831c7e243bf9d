use chrono::{DateTime, Utc};
use futures::stream::StreamExt;

use crate::{
    apis::authproxyworkload_types::{
        AuthProxyWorkload, AuthProxyWorkloadStatus, RolloutStrategy, WorkloadStatus,
        CONDITION_UP_TO_DATE, CONDITION_WORKLOAD_UP_TO_DATE, REASON_FINISHED_RECONCILE,
        REASON_NEEDS_UPDATE, REASON_NO_WORKLOADS_FOUND, REASON_STARTED_RECONCILE,
        REASON_UP_TO_DATE,
    },
    names, telemetry,
    workload::{self, Workload},
    Error, Metrics, Result,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config as watcherConfig,
    },
    Resource,
};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::{
    collections::HashSet,
    sync::Arc,
};
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

pub static APW_FINALIZER: &str = "authproxy.io/AuthProxyWorkload-finalizer";

/// Immediate redelivery: the reconciler made progress and wants the next
/// state transition right away.
pub const SHORT_REQUEUE: Duration = Duration::ZERO;
/// The webhook has not applied a requested change yet; check back later.
pub const LONG_REQUEUE: Duration = Duration::from_secs(30);

/// Handles shared by every reconcile invocation
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// AuthProxyWorkloads deleted by this process, so a later 404 read is
    /// distinguishable from an eventually-consistent one
    pub recently_deleted: Arc<RwLock<HashSet<(String, String)>>>,
}

#[instrument(skip(ctx, apw), fields(trace_id))]
async fn reconcile(apw: Arc<AuthProxyWorkload>, ctx: Arc<Context>) -> Result<Action> {
    Span::current().record("trace_id", field::display(&telemetry::get_trace_id()));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = apw.namespace().unwrap_or_default();
    let name = apw.name_any();
    let apws: Api<AuthProxyWorkload> = Api::namespaced(ctx.client.clone(), &ns);

    // Always run the state machine against a fresh read; the watch event
    // that triggered us may be stale by now
    let fresh = match apws.get(&name).await {
        Ok(obj) => {
            ctx.recently_deleted
                .write()
                .await
                .remove(&(ns.clone(), name.clone()));
            obj
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            if ctx
                .recently_deleted
                .read()
                .await
                .contains(&(ns.clone(), name.clone()))
            {
                debug!("AuthProxyWorkload {}/{} is gone, nothing to do", ns, name);
                return Ok(Action::await_change());
            }
            // not found but never deleted by us: likely a stale read
            return Ok(Action::requeue(LONG_REQUEUE));
        }
        Err(e) => return Err(Error::KubeError(e)),
    };

    debug!("Reconciling AuthProxyWorkload \"{}\" in {}", name, ns);
    finalizer(&apws, APW_FINALIZER, Arc::new(fresh), |event| async {
        match event {
            Finalizer::Apply(apw) => match apw.reconcile(ctx.clone()).await {
                Ok(action) => Ok(action),
                Err(requeue_action) => Ok(requeue_action),
            },
            Finalizer::Cleanup(apw) => apw.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

/// Base delay when the API server answers 429; jitter spreads the retries
/// of many AuthProxyWorkloads so they don't stampede back at once.
const THROTTLE_BASE_SECS: u64 = 60;
const THROTTLE_JITTER_SECS: u64 = 120;

pub(crate) fn error_policy(apw: Arc<AuthProxyWorkload>, error: &Error, ctx: Arc<Context>) -> Action {
    let ns = apw.namespace().unwrap_or_default();
    let name = apw.name_any();
    warn!(
        "reconcile of AuthProxyWorkload {}/{} failed: {:?}",
        ns, name, error
    );
    ctx.metrics.reconcile_failure(&apw, error);

    if let Error::KubeError(kube::Error::Api(api_error)) = error {
        if api_error.code == 429 {
            let delay =
                THROTTLE_BASE_SECS + rand::thread_rng().gen_range(0..THROTTLE_JITTER_SECS);
            warn!(
                "API server is throttling, retrying AuthProxyWorkload {}/{} in {}s",
                ns, name, delay
            );
            return Action::requeue(Duration::from_secs(delay));
        }
    }
    Action::requeue(Duration::from_secs(5))
}

fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// How far each matched workload has progressed toward the current
/// generation, split into the ones that still need the request annotation
/// (`to_mark`) and the ones waiting on the webhook (`waiting`).
struct WorkloadProgress {
    statuses: Vec<WorkloadStatus>,
    to_mark: Vec<usize>,
    waiting: usize,
}

fn classify_workloads(
    workloads: &[Workload],
    request_key: &str,
    result_key: &str,
    generation: i64,
) -> WorkloadProgress {
    let generation_str = generation.to_string();
    let mut progress = WorkloadProgress {
        statuses: Vec::with_capacity(workloads.len()),
        to_mark: Vec::new(),
        waiting: 0,
    };
    for (i, w) in workloads.iter().enumerate() {
        let requested = w.annotation(request_key).cloned();
        let applied = w.annotation(result_key).cloned();
        let marked = requested.as_deref() == Some(generation_str.as_str());
        let applied_current = applied.as_deref() == Some(generation_str.as_str());
        let up_to_date = marked && applied_current;
        if !up_to_date {
            if marked {
                progress.waiting += 1;
            } else {
                progress.to_mark.push(i);
            }
        }
        let (reason, message) = if up_to_date {
            (REASON_UP_TO_DATE, "proxy configuration is applied")
        } else {
            (REASON_NEEDS_UPDATE, "waiting for the workload webhook")
        };
        progress.statuses.push(WorkloadStatus {
            kind: w.kind().to_string(),
            api_version: w.api_version().to_string(),
            namespace: w.namespace(),
            name: w.name(),
            conditions: Some(vec![condition(
                CONDITION_WORKLOAD_UP_TO_DATE,
                up_to_date,
                reason,
                message,
                Some(generation),
            )]),
            last_requested_generation: requested.and_then(|v| v.parse().ok()),
            last_updated_generation: applied.and_then(|v| v.parse().ok()),
        });
    }
    progress
}

/// Matching workloads with owner-managed objects filtered out; those belong
/// to a higher-level controller and are never touched.
async fn matching_workloads(client: Client, apw: &AuthProxyWorkload) -> Result<Vec<Workload>> {
    let ns = apw.namespace().unwrap_or_default();
    let workloads = workload::resolve(client, &apw.spec.workload_selector, &ns).await?;
    Ok(workloads
        .into_iter()
        .filter(|w| w.owner_references().is_empty())
        .collect())
}

impl AuthProxyWorkload {
    // Reconcile (for non-finalizer related changes)
    #[instrument(skip(self, ctx))]
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, Action> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let generation = self.metadata.generation.unwrap_or(0);
        let apws: Api<AuthProxyWorkload> = Api::namespaced(client.clone(), &ns);

        let workloads = matching_workloads(client.clone(), self).await.map_err(|e| {
            error!("Error listing workloads for {}/{}: {:?}", ns, name, e);
            Action::requeue(Duration::from_secs(5))
        })?;

        if workloads.is_empty() {
            let status = AuthProxyWorkloadStatus {
                conditions: Some(vec![condition(
                    CONDITION_UP_TO_DATE,
                    true,
                    REASON_NO_WORKLOADS_FOUND,
                    "no workloads matched the selector",
                    Some(generation),
                )]),
                workload_status: Some(vec![]),
            };
            patch_apw_status_merge(&apws, &name, &status).await?;
            return Ok(Action::await_change());
        }

        let request_key = names::request_annotation(&ns, &name);
        let result_key = names::result_annotation(&ns, &name);
        let progress = classify_workloads(&workloads, &request_key, &result_key, generation);

        if progress.to_mark.is_empty() && progress.waiting == 0 {
            let status = AuthProxyWorkloadStatus {
                conditions: Some(vec![condition(
                    CONDITION_UP_TO_DATE,
                    true,
                    REASON_FINISHED_RECONCILE,
                    "all workloads are up to date",
                    Some(generation),
                )]),
                workload_status: Some(progress.statuses),
            };
            patch_apw_status_merge(&apws, &name, &status).await?;
            info!("Fully reconciled AuthProxyWorkload {}/{}", ns, name);
            return Ok(Action::await_change());
        }

        // The reconciler only marks; the admission webhook applies. A
        // rollout strategy of None leaves the rollout to the user.
        if self.rollout_strategy() == RolloutStrategy::Workload {
            for i in &progress.to_mark {
                let w = &workloads[*i];
                if let Err(e) = workload::patch_annotation(
                    client.clone(),
                    w,
                    &request_key,
                    &generation.to_string(),
                )
                .await
                {
                    // partial failure is tolerable, the requeue retries
                    error!(
                        "Failed to annotate {} {}/{}: {:?}",
                        w.kind(),
                        w.namespace(),
                        w.name(),
                        e
                    );
                }
            }
        }

        let status = AuthProxyWorkloadStatus {
            conditions: Some(vec![condition(
                CONDITION_UP_TO_DATE,
                false,
                REASON_STARTED_RECONCILE,
                "requested proxy updates on matching workloads",
                Some(generation),
            )]),
            workload_status: Some(progress.statuses),
        };
        patch_apw_status_merge(&apws, &name, &status).await?;

        if progress.to_mark.is_empty() || self.rollout_strategy() == RolloutStrategy::None {
            Ok(Action::requeue(LONG_REQUEUE))
        } else {
            Ok(Action::requeue(SHORT_REQUEUE))
        }
    }

    // Finalizer cleanup (the object was deleted, revert the workloads)
    #[instrument(skip(self, ctx))]
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let client = ctx.client.clone();
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let generation = self.metadata.generation.unwrap_or(0);

        // One more annotation bump per workload so the webhook re-runs with
        // this AuthProxyWorkload absent and reverts its modifications
        let workloads = matching_workloads(client.clone(), self).await?;
        let request_key = names::request_annotation(&ns, &name);
        for w in &workloads {
            if let Err(e) = workload::patch_annotation(
                client.clone(),
                w,
                &request_key,
                &generation.to_string(),
            )
            .await
            {
                error!(
                    "Failed to annotate {} {}/{} during cleanup: {:?}",
                    w.kind(),
                    w.namespace(),
                    w.name(),
                    e
                );
            }
        }

        ctx.recently_deleted
            .write()
            .await
            .insert((ns.clone(), name.clone()));

        let recorder = ctx
            .diagnostics
            .read()
            .await
            .recorder(client.clone(), self);
        if let Err(e) = recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteAuthProxyWorkload".into(),
                note: Some(format!("Delete `{name}`")),
                action: "Reconciling".into(),
                secondary: None,
            })
            .await
        {
            warn!("Failed to publish delete event for {}/{}: {:?}", ns, name, e);
        }
        Ok(Action::await_change())
    }
}

pub async fn patch_apw_status_merge(
    apws: &Api<AuthProxyWorkload>,
    name: &str,
    status: &AuthProxyWorkloadStatus,
) -> Result<(), Action> {
    let patch = json!({
        "apiVersion": "authproxy.io/v1",
        "kind": "AuthProxyWorkload",
        "status": status
    });
    let pp = PatchParams {
        field_manager: Some("auth-proxy-operator".to_string()),
        ..PatchParams::default()
    };
    match apws.patch_status(name, &pp, &Patch::Merge(patch)).await {
        Ok(_) => {
            debug!("status patch applied for AuthProxyWorkload {}", name);
            Ok(())
        }
        Err(e) => {
            error!(
                "status patch for AuthProxyWorkload {} was rejected: {:?}",
                name, e
            );
            Err(Action::requeue(Duration::from_secs(10)))
        }
    }
}

/// Liveness information served on the diagnostics endpoint
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "auth-proxy-operator".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client, apw: &AuthProxyWorkload) -> Recorder {
        Recorder::new(client, self.reporter.clone(), apw.object_ref(&()))
    }
}

/// Everything the reconciler and the web server share: diagnostics, the
/// metrics registry, and the recently-deleted set
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Metrics handles, registered once
    metrics: Metrics,
    /// Shared with every Context; see Context::recently_deleted
    recently_deleted: Arc<RwLock<HashSet<(String, String)>>>,
}

impl Default for State {
    fn default() -> Self {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default()
            .register(&registry)
            .expect("metrics register once");
        Self {
            diagnostics: Default::default(),
            registry,
            metrics,
            recently_deleted: Default::default(),
        }
    }
}

impl State {
    /// Gather all registered metrics in the Prometheus text format
    pub fn metrics(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }

    /// Metrics handle for the admission webhook
    pub fn admission_metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Build the Context handed to every reconcile invocation
    pub fn create_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            recently_deleted: self.recently_deleted.clone(),
        })
    }
}

/// Start the AuthProxyWorkload controller and drive it until shutdown.
pub async fn run(state: State) {
    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => panic!("no usable kubeconfig or in-cluster environment: {e}"),
    };

    // Fail fast when the AuthProxyWorkload CRD has not been applied yet;
    // without it the watch below would just spin on errors
    let apws = Api::<AuthProxyWorkload>::all(client.clone());
    if let Err(e) = apws.list(&ListParams::default().limit(1)).await {
        error!("AuthProxyWorkload CRD is not available: {e:?}");
        info!("Generate and apply it first: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(apws, watcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.create_context(client))
        .for_each(|dispatch| async move {
            if let Err(e) = dispatch {
                debug!("reconcile dispatch failed: {:?}", e);
            }
        })
        .await;
}
