use actix_web::{post, web, HttpResponse, Responder};
use json_patch::diff;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject, TypeMeta,
};
use kube::{api::ListParams, Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::*;

use crate::{
    apis::authproxyworkload_types::AuthProxyWorkload,
    config::Config,
    podspec, telemetry,
    workload::{self, Workload},
    Error, Metrics,
};

/// Mutating admission endpoint for the six workload kinds. The reconciler
/// only marks workloads; this handler is the one place pod specs change.
#[instrument(skip(body, config, client, metrics), fields(trace_id))]
#[post("/mutate-workloads")]
pub async fn mutate_workloads(
    body: web::Json<AdmissionReview<DynamicObject>>,
    config: web::Data<Config>,
    client: web::Data<Arc<Client>>,
    metrics: web::Data<Metrics>,
) -> impl Responder {
    Span::current().record("trace_id", field::display(&telemetry::get_trace_id()));

    let review = body.into_inner();
    let request: AdmissionRequest<DynamicObject> = match review.request {
        Some(request) => request,
        None => {
            return HttpResponse::BadRequest().body("malformed AdmissionReview: request missing");
        }
    };

    let kind = request.kind.kind.clone();
    if !workload::SUPPORTED_KINDS.contains(&kind.as_str()) {
        metrics.admission(&kind, "unsupported");
        return HttpResponse::InternalServerError()
            .body(format!("unsupported resource kind: {kind}"));
    }

    let object = match request.object.as_ref() {
        Some(object) => object,
        None => {
            return HttpResponse::BadRequest().body("malformed AdmissionReview: object missing");
        }
    };
    let original = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(e) => {
            metrics.admission(&kind, "error");
            return HttpResponse::InternalServerError()
                .body(format!("failed to read {kind}: {e}"));
        }
    };
    let mut wl = match Workload::from_kind_and_object(&kind, original.clone()) {
        Ok(wl) => wl,
        Err(e) => {
            metrics.admission(&kind, "error");
            return HttpResponse::InternalServerError().body(e.to_string());
        }
    };

    // Workloads owned by a higher-level controller are left alone; mutating
    // them would fight that controller
    if !wl.owner_references().is_empty() {
        debug!(
            "Skipping owned {} {}/{}",
            kind,
            wl.namespace(),
            wl.name()
        );
        metrics.admission(&kind, "skipped");
        return respond(request, None);
    }

    let namespace = request
        .namespace
        .clone()
        .unwrap_or_else(|| wl.namespace());
    let apws: Api<AuthProxyWorkload> = Api::namespaced(client.as_ref().as_ref().clone(), &namespace);
    let all = match apws.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(e) => {
            error!(
                "Failed to list AuthProxyWorkloads in {}: {:?}",
                namespace, e
            );
            metrics.admission(&kind, "error");
            return HttpResponse::InternalServerError()
                .body(format!("failed to list AuthProxyWorkloads: {e}"));
        }
    };
    // AuthProxyWorkloads being deleted no longer match, so one last pass
    // through here reverts their modifications
    let matching: Vec<AuthProxyWorkload> = all
        .into_iter()
        .filter(|apw| apw.metadata.deletion_timestamp.is_none())
        .filter(|apw| {
            let owner_ns = apw.namespace().unwrap_or_else(|| namespace.clone());
            workload::matches(&wl, &apw.spec.workload_selector, &owner_ns)
        })
        .collect();

    match podspec::configure_workload(&mut wl, &matching, &config.proxy_image) {
        Ok(false) => {
            metrics.admission(&kind, "unchanged");
            respond(request, None)
        }
        Ok(true) => {
            let mut mutated = match wl.to_json() {
                Ok(value) => value,
                Err(e) => {
                    metrics.admission(&kind, "error");
                    return HttpResponse::InternalServerError().body(e.to_string());
                }
            };
            // k8s-openapi types do not carry type meta; keep the original's
            // so the diff never touches apiVersion/kind
            if let (Some(obj), Some(orig)) = (mutated.as_object_mut(), original.as_object()) {
                for key in ["apiVersion", "kind"] {
                    if let Some(v) = orig.get(key) {
                        obj.insert(key.to_string(), v.clone());
                    }
                }
            }
            let patch = diff(&original, &mutated);
            debug!("admission patch for {} {}: {:?}", kind, wl.name(), patch);
            metrics.admission(&kind, "patched");
            respond(request, Some(patch))
        }
        Err(Error::ProxyConfig(config_error)) => {
            warn!(
                "Rejecting {} {}/{}: {}",
                kind,
                wl.namespace(),
                wl.name(),
                config_error
            );
            metrics.admission(&kind, "rejected");
            HttpResponse::InternalServerError().body(config_error.to_string())
        }
        Err(e) => {
            metrics.admission(&kind, "error");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

// Wrap an allowed AdmissionResponse (with an optional patch) back into the
// review envelope.
fn respond(request: AdmissionRequest<DynamicObject>, patch: Option<json_patch::Patch>) -> HttpResponse {
    let mut response = AdmissionResponse::from(&request);
    if let Some(patch) = patch {
        if !patch.0.is_empty() {
            response = match response.with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    return HttpResponse::InternalServerError()
                        .body(format!("failed to serialize patch: {e}"));
                }
            };
        }
    }
    HttpResponse::Ok().json(AdmissionReview {
        response: Some(response),
        request: Some(request),
        types: TypeMeta {
            api_version: "admission.k8s.io/v1".to_string(),
            kind: "AdmissionReview".to_string(),
        },
    })
}
