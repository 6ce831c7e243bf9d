use crate::names;
use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Identity of the AuthProxyWorkload that owns a recorded modification.
/// Stored as a weak reference; never a live handle to the object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApwRef {
    pub namespace: String,
    pub name: String,
}

impl ApwRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// An env var the operator set on user containers, with the values it
/// overwrote so they can be restored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedEnvVar {
    pub auth_proxy_workload: ApwRef,
    pub connection_string: String,
    pub operator_managed_value: EnvVar,
    #[serde(default)]
    pub original_values: BTreeMap<String, String>,
}

/// A volume plus mount injected for a unix-socket instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedVolume {
    pub auth_proxy_workload: ApwRef,
    pub connection_string: String,
    pub volume: Volume,
    pub volume_mount: VolumeMount,
}

/// One port known to be in use in the pod: either claimed by a user
/// container (no owner) or allocated to a proxy instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedPort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_proxy_workload: Option<ApwRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    pub port: i32,
    #[serde(default)]
    pub original_values: BTreeMap<String, i32>,
}

/// Record of every modification the operator has made to one workload,
/// persisted as the `csql-env` annotation. Rebuilt from scratch on every
/// mutator run; `original_values` carry forward and are never overwritten
/// once recorded.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    #[serde(default)]
    pub auth_proxy_workloads: Vec<ApwRef>,
    #[serde(default)]
    pub env_vars: Vec<ManagedEnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<ManagedVolume>,
    #[serde(default)]
    pub ports: Vec<ManagedPort>,
}

impl Ledger {
    /// Parse the ledger out of a workload's annotations. An unreadable
    /// ledger is treated as empty so reconciliation never fails on it.
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Ledger {
        let Some(raw) = annotations.and_then(|a| a.get(names::LEDGER_ANNOTATION)) else {
            return Ledger::default();
        };
        match serde_json::from_str(raw) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!(
                    "unreadable {} annotation, treating as empty: {}",
                    names::LEDGER_ANNOTATION,
                    e
                );
                Ledger::default()
            }
        }
    }

    pub fn to_annotation_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_empty(&self) -> bool {
        self.auth_proxy_workloads.is_empty()
            && self.env_vars.is_empty()
            && self.volume_mounts.is_empty()
            && self.ports.is_empty()
    }

    /// Record a port claimed by a user container. Repeat claims of the same
    /// port coalesce into one entry.
    pub fn record_user_port(&mut self, port: i32, container: &str) {
        if let Some(entry) = self
            .ports
            .iter_mut()
            .find(|p| p.auth_proxy_workload.is_none() && p.port == port)
        {
            entry.original_values.insert(container.to_string(), port);
            return;
        }
        self.ports.push(ManagedPort {
            auth_proxy_workload: None,
            connection_string: None,
            port,
            original_values: BTreeMap::from([(container.to_string(), port)]),
        });
    }

    /// Record a port allocated to a proxy instance (or, with no connection
    /// string, a proxy health-check server). Re-recording the same
    /// `(owner, connection_string)` key replaces the port.
    pub fn record_owned_port(&mut self, owner: &ApwRef, connection_string: Option<&str>, port: i32) {
        if let Some(entry) = self.ports.iter_mut().find(|p| {
            p.auth_proxy_workload.as_ref() == Some(owner)
                && p.connection_string.as_deref() == connection_string
        }) {
            entry.port = port;
            return;
        }
        self.ports.push(ManagedPort {
            auth_proxy_workload: Some(owner.clone()),
            connection_string: connection_string.map(|s| s.to_string()),
            port,
            original_values: BTreeMap::new(),
        });
    }

    pub fn owned_port(&self, owner: &ApwRef, connection_string: Option<&str>) -> Option<i32> {
        self.ports
            .iter()
            .find(|p| {
                p.auth_proxy_workload.as_ref() == Some(owner)
                    && p.connection_string.as_deref() == connection_string
            })
            .map(|p| p.port)
    }

    pub fn port_in_use(&self, port: i32) -> bool {
        self.ports.iter().any(|p| p.port == port)
    }

    pub fn env_var(&self, name: &str) -> Option<&ManagedEnvVar> {
        self.env_vars
            .iter()
            .find(|e| e.operator_managed_value.name == name)
    }

    /// Store a managed volume. Re-inserting the same volume name replaces
    /// the entry rather than duplicating it.
    pub fn record_volume(&mut self, managed: ManagedVolume) {
        if let Some(entry) = self
            .volume_mounts
            .iter_mut()
            .find(|v| v.volume.name == managed.volume.name)
        {
            *entry = managed;
            return;
        }
        self.volume_mounts.push(managed);
    }
}
