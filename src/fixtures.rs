//! Helper objects shared by unit tests.

use crate::{
    apis::authproxyworkload_types::{
        AuthProxyWorkload, AuthProxyWorkloadSpec, InstanceSpec, WorkloadSelectorSpec,
    },
    workload::Workload,
};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        batch::v1::{CronJob, Job},
        core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference},
};
use std::collections::BTreeMap;

pub fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

pub fn empty_workload(kind: &str, namespace: &str, name: &str) -> Workload {
    let metadata = object_meta(namespace, name);
    match kind {
        "Deployment" => Workload::Deployment(Deployment {
            metadata,
            ..Default::default()
        }),
        "StatefulSet" => Workload::StatefulSet(StatefulSet {
            metadata,
            ..Default::default()
        }),
        "DaemonSet" => Workload::DaemonSet(DaemonSet {
            metadata,
            ..Default::default()
        }),
        "Job" => Workload::Job(Job {
            metadata,
            ..Default::default()
        }),
        "CronJob" => Workload::CronJob(CronJob {
            metadata,
            ..Default::default()
        }),
        "Pod" => Workload::Pod(Pod {
            metadata,
            ..Default::default()
        }),
        other => panic!("unsupported kind {other}"),
    }
}

/// A Pod workload with one user container named `app` and the given labels.
pub fn labeled_pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Workload {
    let mut metadata = object_meta(namespace, name);
    metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    Workload::Pod(Pod {
        metadata,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("busybox:latest".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Like `labeled_pod`, but owned by a ReplicaSet; the engine must ignore it.
pub fn owned_pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Workload {
    let Workload::Pod(mut pod) = labeled_pod(namespace, name, labels) else {
        unreachable!("labeled_pod builds a Pod");
    };
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "ReplicaSet".to_string(),
        name: "owner-rs".to_string(),
        uid: "5f3c7f6e-owner".to_string(),
        ..Default::default()
    }]);
    Workload::Pod(pod)
}

/// Add an env var to the first container of the workload's pod spec.
pub fn with_env(mut workload: Workload, name: &str, value: &str) -> Workload {
    let mut spec = workload.pod_spec();
    spec.containers[0]
        .env
        .get_or_insert_with(Vec::new)
        .push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        });
    workload.set_pod_spec(spec);
    workload
}

/// Add a container port to the first container of the workload's pod spec.
pub fn with_container_port(mut workload: Workload, port: i32) -> Workload {
    let mut spec = workload.pod_spec();
    spec.containers[0]
        .ports
        .get_or_insert_with(Vec::new)
        .push(ContainerPort {
            container_port: port,
            ..Default::default()
        });
    workload.set_pod_spec(spec);
    workload
}

pub fn tcp_instance(connection_string: &str) -> InstanceSpec {
    InstanceSpec {
        connection_string: connection_string.to_string(),
        ..Default::default()
    }
}

/// An AuthProxyWorkload matching Pods labeled `app=x`, with one instance.
pub fn test_apw(namespace: &str, name: &str, instances: Vec<InstanceSpec>) -> AuthProxyWorkload {
    let mut apw = AuthProxyWorkload::new(
        name,
        AuthProxyWorkloadSpec {
            workload_selector: WorkloadSelectorSpec {
                kind: "Pod".to_string(),
                selector: Some(LabelSelector {
                    match_labels: Some([("app".to_string(), "x".to_string())].into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            instances,
            auth_proxy_container: None,
        },
    );
    apw.metadata.namespace = Some(namespace.to_string());
    apw.metadata.generation = Some(1);
    apw
}
