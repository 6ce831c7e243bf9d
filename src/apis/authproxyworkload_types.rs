use k8s_openapi::{
    api::core::v1::{Container, ResourceRequirements, SecurityContext},
    apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector},
};
use kube::CustomResource;
use lazy_static::lazy_static;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported on the AuthProxyWorkload status.
pub const CONDITION_UP_TO_DATE: &str = "UpToDate";
/// Condition type reported per target workload in `status.workloadStatus`.
pub const CONDITION_WORKLOAD_UP_TO_DATE: &str = "WorkloadUpToDate";

pub const REASON_STARTED_RECONCILE: &str = "StartedReconcile";
pub const REASON_FINISHED_RECONCILE: &str = "FinishedReconcile";
pub const REASON_NO_WORKLOADS_FOUND: &str = "NoWorkloadsFound";
pub const REASON_NEEDS_UPDATE: &str = "NeedsUpdate";
pub const REASON_UP_TO_DATE: &str = "UpToDate";

lazy_static! {
    static ref CONNECTION_STRING: Regex =
        Regex::new(r"^([^:]+(:[^:]+)?):([^:]+):([^:]+)$").expect("valid connection string regex");
}

/// True when `s` looks like `project:region:instance` (the project segment
/// may carry a domain prefix, `domain.com:project`).
pub fn valid_connection_string(s: &str) -> bool {
    CONNECTION_STRING.is_match(s)
}

/// Generate the Kubernetes wrapper struct `AuthProxyWorkload` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    kind = "AuthProxyWorkload",
    group = "authproxy.io",
    version = "v1",
    namespaced
)]
#[kube(status = "AuthProxyWorkloadStatus", shortname = "apw")]
#[serde(rename_all = "camelCase")]
pub struct AuthProxyWorkloadSpec {
    /// Which workloads receive the proxy sidecar.
    pub workload_selector: WorkloadSelectorSpec,

    /// Database instances the sidecar exposes to the workload.
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,

    /// Settings for the injected proxy container.
    pub auth_proxy_container: Option<AuthProxyContainerSpec>,
}

/// Selects workloads by kind plus either an exact name or a label selector.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelectorSpec {
    /// One of Deployment, StatefulSet, DaemonSet, Job, CronJob, Pod.
    pub kind: String,

    /// Defaults to the AuthProxyWorkload's own namespace.
    pub namespace: Option<String>,

    pub name: Option<String>,

    pub selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Tcp,
    Unix,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Instance identifier in `project:region:instance` form.
    pub connection_string: String,

    /// Defaults to tcp, or unix when unixSocketPath is set.
    pub socket_type: Option<SocketType>,

    /// TCP port the proxy listens on for this instance. Allocated from 5000
    /// upward when unset.
    pub port: Option<i32>,

    #[serde(rename = "autoIAMAuthN")]
    pub auto_iam_auth_n: Option<bool>,

    #[serde(rename = "privateIP")]
    pub private_ip: Option<bool>,

    /// Env var set on every user container holding the proxy host.
    pub host_env_name: Option<String>,

    /// Env var set on every user container holding the allocated port.
    pub port_env_name: Option<String>,

    pub unix_socket_path: Option<String>,

    pub unix_socket_path_env_name: Option<String>,

    pub fuse_dir: Option<String>,

    pub fuse_temp_dir: Option<String>,
}

impl InstanceSpec {
    pub fn effective_socket_type(&self) -> SocketType {
        match self.socket_type {
            Some(t) => t,
            None if self.unix_socket_path.is_some() => SocketType::Unix,
            None => SocketType::Tcp,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum RolloutStrategy {
    Workload,
    None,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStrategy {
    Lazy,
    Background,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthProxyContainerSpec {
    /// Full container override. When set, all other fields except
    /// rolloutStrategy are ignored and the container is injected as-is.
    pub container: Option<Container>,

    pub image: Option<String>,

    pub resources: Option<ResourceRequirements>,

    pub security_context: Option<SecurityContext>,

    pub telemetry: Option<TelemetrySpec>,

    pub admin_server: Option<AdminServerSpec>,

    pub authentication: Option<AuthenticationSpec>,

    pub max_connections: Option<i64>,

    pub max_sigterm_delay: Option<i64>,

    #[serde(rename = "sqlAdminAPIEndpoint")]
    pub sql_admin_api_endpoint: Option<String>,

    /// Workload (default) rolls matching workloads to pick up changes; None
    /// leaves the rollout to the user.
    pub rollout_strategy: Option<RolloutStrategy>,

    /// background (default) refreshes certificates ahead of connections;
    /// lazy refreshes on demand.
    pub refresh_strategy: Option<RefreshStrategy>,

    pub quiet: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySpec {
    pub quota_project: Option<String>,
    pub prometheus: Option<bool>,
    pub prometheus_namespace: Option<String>,
    pub telemetry_project: Option<String>,
    pub telemetry_prefix: Option<String>,
    pub telemetry_sample_rate: Option<i64>,
    pub disable_traces: Option<bool>,
    pub disable_metrics: Option<bool>,
    /// Port for the proxy's health-check server. Allocated from 9801 upward
    /// when unset.
    pub http_port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdminServerSpec {
    pub port: i32,
    /// Any of "Debug" and "QuitQuitQuit".
    #[serde(rename = "enableAPIs", default)]
    pub enable_apis: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    #[serde(default)]
    pub impersonation_chain: Vec<String>,
}

/// The status object of `AuthProxyWorkload`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthProxyWorkloadStatus {
    pub conditions: Option<Vec<Condition>>,
    pub workload_status: Option<Vec<WorkloadStatus>>,
}

/// Reconcile progress for one matched workload.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    pub conditions: Option<Vec<Condition>>,
    pub last_requested_generation: Option<i64>,
    pub last_updated_generation: Option<i64>,
}

impl AuthProxyWorkload {
    pub fn rollout_strategy(&self) -> RolloutStrategy {
        self.spec
            .auth_proxy_container
            .as_ref()
            .and_then(|c| c.rollout_strategy)
            .unwrap_or(RolloutStrategy::Workload)
    }

    pub fn refresh_strategy(&self) -> RefreshStrategy {
        self.spec
            .auth_proxy_container
            .as_ref()
            .and_then(|c| c.refresh_strategy)
            .unwrap_or(RefreshStrategy::Background)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_strings() {
        assert!(valid_connection_string("proj:region:db"));
        assert!(valid_connection_string("domain.com:proj:region:db"));
        assert!(!valid_connection_string("proj:db"));
        assert!(!valid_connection_string("a:b:c:d:e"));
        assert!(!valid_connection_string(""));
    }

    #[test]
    fn spec_serializes_camel_case() {
        let spec = AuthProxyWorkloadSpec {
            workload_selector: WorkloadSelectorSpec {
                kind: "Deployment".to_string(),
                name: Some("web".to_string()),
                ..Default::default()
            },
            instances: vec![InstanceSpec {
                connection_string: "p:r:db".to_string(),
                port_env_name: Some("DB_PORT".to_string()),
                auto_iam_auth_n: Some(true),
                ..Default::default()
            }],
            auth_proxy_container: None,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["workloadSelector"]["kind"], "Deployment");
        assert_eq!(json["instances"][0]["connectionString"], "p:r:db");
        assert_eq!(json["instances"][0]["portEnvName"], "DB_PORT");
        assert_eq!(json["instances"][0]["autoIAMAuthN"], true);
    }

    #[test]
    fn socket_type_defaults_follow_unix_socket_path() {
        let tcp = InstanceSpec {
            connection_string: "p:r:db".to_string(),
            ..Default::default()
        };
        assert_eq!(tcp.effective_socket_type(), SocketType::Tcp);

        let unix = InstanceSpec {
            connection_string: "p:r:db".to_string(),
            unix_socket_path: Some("/sock".to_string()),
            ..Default::default()
        };
        assert_eq!(unix.effective_socket_type(), SocketType::Unix);

        let explicit = InstanceSpec {
            connection_string: "p:r:db".to_string(),
            socket_type: Some(SocketType::Tcp),
            unix_socket_path: Some("/sock".to_string()),
            ..Default::default()
        };
        assert_eq!(explicit.effective_socket_type(), SocketType::Tcp);
    }

    #[test]
    fn strategies_default_when_unset() {
        let apw = AuthProxyWorkload::new("apw1", AuthProxyWorkloadSpec::default());
        assert_eq!(apw.rollout_strategy(), RolloutStrategy::Workload);
        assert_eq!(apw.refresh_strategy(), RefreshStrategy::Background);
    }

    #[test]
    fn strategy_enums_serialize_expected_tokens() {
        assert_eq!(
            serde_json::to_value(RolloutStrategy::None).unwrap(),
            serde_json::json!("None")
        );
        assert_eq!(
            serde_json::to_value(RefreshStrategy::Lazy).unwrap(),
            serde_json::json!("lazy")
        );
        assert_eq!(
            serde_json::to_value(SocketType::Unix).unwrap(),
            serde_json::json!("unix")
        );
    }
}
