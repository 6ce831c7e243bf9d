use crate::{apis::authproxyworkload_types::WorkloadSelectorSpec, Error, Result};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        batch::v1::{CronJob, Job},
        core::v1::{Pod, PodSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
    NamespaceResourceScope,
};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, fmt::Debug};

pub const SUPPORTED_KINDS: [&str; 6] = [
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
    "Pod",
];

/// One of the six workload kinds the operator can inject a proxy into.
/// Each variant knows how to reach its own pod template; everything else in
/// the engine works on this wrapper.
#[derive(Clone, Debug)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    Job(Job),
    CronJob(CronJob),
    Pod(Pod),
}

impl Workload {
    pub fn from_kind_and_object(kind: &str, object: serde_json::Value) -> Result<Workload> {
        let wl = match kind {
            "Deployment" => Workload::Deployment(
                serde_json::from_value(object).map_err(Error::SerializationError)?,
            ),
            "StatefulSet" => Workload::StatefulSet(
                serde_json::from_value(object).map_err(Error::SerializationError)?,
            ),
            "DaemonSet" => Workload::DaemonSet(
                serde_json::from_value(object).map_err(Error::SerializationError)?,
            ),
            "Job" => {
                Workload::Job(serde_json::from_value(object).map_err(Error::SerializationError)?)
            }
            "CronJob" => Workload::CronJob(
                serde_json::from_value(object).map_err(Error::SerializationError)?,
            ),
            "Pod" => {
                Workload::Pod(serde_json::from_value(object).map_err(Error::SerializationError)?)
            }
            other => return Err(Error::UnknownKind(other.to_string())),
        };
        Ok(wl)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Workload::Deployment(_) => "Deployment",
            Workload::StatefulSet(_) => "StatefulSet",
            Workload::DaemonSet(_) => "DaemonSet",
            Workload::Job(_) => "Job",
            Workload::CronJob(_) => "CronJob",
            Workload::Pod(_) => "Pod",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            Workload::Deployment(_) | Workload::StatefulSet(_) | Workload::DaemonSet(_) => {
                "apps/v1"
            }
            Workload::Job(_) | Workload::CronJob(_) => "batch/v1",
            Workload::Pod(_) => "v1",
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(o) => &o.metadata,
            Workload::StatefulSet(o) => &o.metadata,
            Workload::DaemonSet(o) => &o.metadata,
            Workload::Job(o) => &o.metadata,
            Workload::CronJob(o) => &o.metadata,
            Workload::Pod(o) => &o.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::Deployment(o) => &mut o.metadata,
            Workload::StatefulSet(o) => &mut o.metadata,
            Workload::DaemonSet(o) => &mut o.metadata,
            Workload::Job(o) => &mut o.metadata,
            Workload::CronJob(o) => &mut o.metadata,
            Workload::Pod(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.metadata().namespace.clone().unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().annotations.as_ref()
    }

    pub fn annotation(&self, key: &str) -> Option<&String> {
        self.annotations().and_then(|a| a.get(key))
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    /// Remove an annotation; an emptied map is dropped entirely so a fully
    /// reverted workload compares equal to its pre-injection form.
    pub fn remove_annotation(&mut self, key: &str) {
        let meta = self.metadata_mut();
        if let Some(annotations) = meta.annotations.as_mut() {
            annotations.remove(key);
            if annotations.is_empty() {
                meta.annotations = None;
            }
        }
    }

    pub fn owner_references(&self) -> &[OwnerReference] {
        self.metadata()
            .owner_references
            .as_deref()
            .unwrap_or_default()
    }

    /// The template pod spec, or an empty one when the object carries none.
    pub fn pod_spec(&self) -> PodSpec {
        match self {
            Workload::Deployment(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.clone())
                .unwrap_or_default(),
            Workload::StatefulSet(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.clone())
                .unwrap_or_default(),
            Workload::DaemonSet(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.clone())
                .unwrap_or_default(),
            Workload::Job(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.clone())
                .unwrap_or_default(),
            Workload::CronJob(o) => o
                .spec
                .as_ref()
                .and_then(|s| s.job_template.spec.as_ref())
                .and_then(|js| js.template.spec.clone())
                .unwrap_or_default(),
            Workload::Pod(o) => o.spec.clone().unwrap_or_default(),
        }
    }

    pub fn set_pod_spec(&mut self, pod_spec: PodSpec) {
        match self {
            Workload::Deployment(o) => {
                o.spec.get_or_insert_with(Default::default).template.spec = Some(pod_spec);
            }
            Workload::StatefulSet(o) => {
                o.spec.get_or_insert_with(Default::default).template.spec = Some(pod_spec);
            }
            Workload::DaemonSet(o) => {
                o.spec.get_or_insert_with(Default::default).template.spec = Some(pod_spec);
            }
            Workload::Job(o) => {
                o.spec.get_or_insert_with(Default::default).template.spec = Some(pod_spec);
            }
            Workload::CronJob(o) => {
                o.spec
                    .get_or_insert_with(Default::default)
                    .job_template
                    .spec
                    .get_or_insert_with(Default::default)
                    .template
                    .spec = Some(pod_spec);
            }
            Workload::Pod(o) => {
                o.spec = Some(pod_spec);
            }
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            Workload::Deployment(o) => serde_json::to_value(o),
            Workload::StatefulSet(o) => serde_json::to_value(o),
            Workload::DaemonSet(o) => serde_json::to_value(o),
            Workload::Job(o) => serde_json::to_value(o),
            Workload::CronJob(o) => serde_json::to_value(o),
            Workload::Pod(o) => serde_json::to_value(o),
        };
        value.map_err(Error::SerializationError)
    }
}

/// True iff the selector picks this workload: the kind matches, the
/// effective namespace matches, and either the name equals the workload's
/// name or the label selector matches its labels.
pub fn matches(workload: &Workload, selector: &WorkloadSelectorSpec, owner_namespace: &str) -> bool {
    if selector.kind != workload.kind() {
        return false;
    }
    let namespace = selector
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(owner_namespace);
    if namespace != workload.namespace() {
        return false;
    }
    if let Some(name) = selector.name.as_deref().filter(|n| !n.is_empty()) {
        return name == workload.name();
    }
    if let Some(label_selector) = &selector.selector {
        return selector_matches_labels(label_selector, &workload.labels());
    }
    false
}

/// In-memory evaluation of a LabelSelector, mirroring the API server's
/// matchLabels + matchExpressions semantics.
pub fn selector_matches_labels(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let value = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or_default();
            let ok = match expr.operator.as_str() {
                "In" => value.is_some_and(|v| values.contains(v)),
                "NotIn" => !value.is_some_and(|v| values.contains(v)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

fn selector_to_label_string(selector: &LabelSelector) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(match_labels) = &selector.match_labels {
        for (k, v) in match_labels {
            parts.push(format!("{k}={v}"));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.as_deref().unwrap_or_default().join(",");
            let part = match expr.operator.as_str() {
                "In" => format!("{} in ({})", expr.key, values),
                "NotIn" => format!("{} notin ({})", expr.key, values),
                "Exists" => expr.key.clone(),
                "DoesNotExist" => format!("!{}", expr.key),
                other => {
                    return Err(Error::InvalidSelector(format!(
                        "unknown label selector operator {other}"
                    )))
                }
            };
            parts.push(part);
        }
    }
    Ok(parts.join(","))
}

/// Resolve a workload selector to the concrete objects it names. A missing
/// named object yields an empty list, not an error.
pub async fn resolve(
    client: Client,
    selector: &WorkloadSelectorSpec,
    default_namespace: &str,
) -> Result<Vec<Workload>> {
    let namespace = selector
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(default_namespace);
    if namespace == "*" {
        return Err(Error::InvalidSelector(
            "wildcard namespaces are not supported".to_string(),
        ));
    }
    match selector.kind.as_str() {
        "Deployment" => fetch::<Deployment>(client, selector, namespace)
            .await
            .map(|v| v.into_iter().map(Workload::Deployment).collect()),
        "StatefulSet" => fetch::<StatefulSet>(client, selector, namespace)
            .await
            .map(|v| v.into_iter().map(Workload::StatefulSet).collect()),
        "DaemonSet" => fetch::<DaemonSet>(client, selector, namespace)
            .await
            .map(|v| v.into_iter().map(Workload::DaemonSet).collect()),
        "Job" => fetch::<Job>(client, selector, namespace)
            .await
            .map(|v| v.into_iter().map(Workload::Job).collect()),
        "CronJob" => fetch::<CronJob>(client, selector, namespace)
            .await
            .map(|v| v.into_iter().map(Workload::CronJob).collect()),
        "Pod" => fetch::<Pod>(client, selector, namespace)
            .await
            .map(|v| v.into_iter().map(Workload::Pod).collect()),
        other => Err(Error::UnknownKind(other.to_string())),
    }
}

async fn fetch<K>(client: Client, selector: &WorkloadSelectorSpec, namespace: &str) -> Result<Vec<K>>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);
    if let Some(name) = selector.name.as_deref().filter(|n| !n.is_empty()) {
        return match api.get(name).await {
            Ok(obj) => Ok(vec![obj]),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(vec![]),
            Err(e) => Err(Error::KubeError(e)),
        };
    }
    let mut lp = ListParams::default();
    if let Some(label_selector) = &selector.selector {
        let labels = selector_to_label_string(label_selector)?;
        if !labels.is_empty() {
            lp = lp.labels(&labels);
        }
    }
    Ok(api.list(&lp).await?.items)
}

/// Merge-patch one annotation onto a workload object.
pub async fn patch_annotation(
    client: Client,
    workload: &Workload,
    key: &str,
    value: &str,
) -> Result<(), kube::Error> {
    let patch = json!({ "metadata": { "annotations": { key: value } } });
    let namespace = workload.namespace();
    let name = workload.name();
    match workload {
        Workload::Deployment(_) => {
            patch_kind::<Deployment>(client, &namespace, &name, &patch).await
        }
        Workload::StatefulSet(_) => {
            patch_kind::<StatefulSet>(client, &namespace, &name, &patch).await
        }
        Workload::DaemonSet(_) => patch_kind::<DaemonSet>(client, &namespace, &name, &patch).await,
        Workload::Job(_) => patch_kind::<Job>(client, &namespace, &name, &patch).await,
        Workload::CronJob(_) => patch_kind::<CronJob>(client, &namespace, &name, &patch).await,
        Workload::Pod(_) => patch_kind::<Pod>(client, &namespace, &name, &patch).await,
    }
}

async fn patch_kind<K>(
    client: Client,
    namespace: &str,
    name: &str,
    patch: &serde_json::Value,
) -> Result<(), kube::Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);
    let pp = PatchParams {
        field_manager: Some("auth-proxy-operator".to_string()),
        ..PatchParams::default()
    };
    api.patch(name, &pp, &Patch::Merge(patch)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    #[test]
    fn from_kind_dispatches_and_rejects_unknown() {
        let pod = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "thing", "namespace": "default" },
            "spec": { "containers": [{ "name": "app" }] }
        });
        let wl = Workload::from_kind_and_object("Pod", pod).unwrap();
        assert_eq!(wl.kind(), "Pod");
        assert_eq!(wl.api_version(), "v1");
        assert_eq!(wl.name(), "thing");

        let err = Workload::from_kind_and_object("ReplicaSet", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::UnknownKind(kind) if kind == "ReplicaSet"));
    }

    #[test]
    fn pod_spec_round_trips_for_every_kind() {
        for kind in SUPPORTED_KINDS {
            let mut wl = fixtures::empty_workload(kind, "default", "thing");
            let mut spec = wl.pod_spec();
            spec.containers = vec![k8s_openapi::api::core::v1::Container {
                name: "app".to_string(),
                ..Default::default()
            }];
            wl.set_pod_spec(spec);
            let read_back = wl.pod_spec();
            assert_eq!(read_back.containers.len(), 1, "kind {kind}");
            assert_eq!(read_back.containers[0].name, "app", "kind {kind}");
        }
    }

    #[test]
    fn annotations_removal_drops_empty_map() {
        let mut wl = fixtures::empty_workload("Pod", "default", "thing");
        wl.set_annotation("csql-env", "{}");
        assert!(wl.annotation("csql-env").is_some());
        wl.remove_annotation("csql-env");
        assert!(wl.annotations().is_none());
    }

    #[test]
    fn matches_by_name_and_namespace_defaulting() {
        let wl = fixtures::labeled_pod("default", "thing", &[("app", "x")]);
        let by_name = WorkloadSelectorSpec {
            kind: "Pod".to_string(),
            name: Some("thing".to_string()),
            ..Default::default()
        };
        assert!(matches(&wl, &by_name, "default"));
        // owner in another namespace does not match without an explicit one
        assert!(!matches(&wl, &by_name, "other"));
        let explicit_ns = WorkloadSelectorSpec {
            kind: "Pod".to_string(),
            namespace: Some("default".to_string()),
            name: Some("thing".to_string()),
            ..Default::default()
        };
        assert!(matches(&wl, &explicit_ns, "other"));
        let wrong_kind = WorkloadSelectorSpec {
            kind: "Deployment".to_string(),
            name: Some("thing".to_string()),
            ..Default::default()
        };
        assert!(!matches(&wl, &wrong_kind, "default"));
    }

    #[test]
    fn matches_by_labels() {
        let wl = fixtures::labeled_pod("default", "thing", &[("app", "x"), ("tier", "db")]);
        let selector = WorkloadSelectorSpec {
            kind: "Pod".to_string(),
            selector: Some(LabelSelector {
                match_labels: Some([("app".to_string(), "x".to_string())].into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches(&wl, &selector, "default"));
        let wrong = WorkloadSelectorSpec {
            kind: "Pod".to_string(),
            selector: Some(LabelSelector {
                match_labels: Some([("app".to_string(), "y".to_string())].into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!matches(&wl, &wrong, "default"));
        // neither name nor selector set never matches
        let neither = WorkloadSelectorSpec {
            kind: "Pod".to_string(),
            ..Default::default()
        };
        assert!(!matches(&wl, &neither, "default"));
    }

    #[test]
    fn selector_expressions() {
        let labels = BTreeMap::from([("app".to_string(), "x".to_string())]);
        let expr = |key: &str, op: &str, values: Option<Vec<&str>>| LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: op.to_string(),
                values: values.map(|v| v.into_iter().map(String::from).collect()),
            }]),
            ..Default::default()
        };
        assert!(selector_matches_labels(
            &expr("app", "In", Some(vec!["x", "y"])),
            &labels
        ));
        assert!(!selector_matches_labels(
            &expr("app", "NotIn", Some(vec!["x"])),
            &labels
        ));
        assert!(selector_matches_labels(&expr("app", "Exists", None), &labels));
        assert!(selector_matches_labels(
            &expr("tier", "DoesNotExist", None),
            &labels
        ));
        assert!(!selector_matches_labels(&expr("tier", "Exists", None), &labels));
    }

    #[test]
    fn selector_to_label_string_formats() {
        let selector = LabelSelector {
            match_labels: Some([("app".to_string(), "x".to_string())].into()),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["db".to_string(), "cache".to_string()]),
            }]),
        };
        assert_eq!(
            selector_to_label_string(&selector).unwrap(),
            "app=x,tier in (db,cache)"
        );
    }
}
