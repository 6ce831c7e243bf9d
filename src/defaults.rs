use k8s_openapi::{
    api::core::v1::{Capabilities, ResourceRequirements, SecurityContext},
    apimachinery::pkg::api::resource::Quantity,
};
use std::collections::BTreeMap;

/// First TCP port assigned to proxy instances that do not request one.
pub const DEFAULT_FIRST_PORT: i32 = 5000;

/// First port probed for the proxy's health-check HTTP server.
pub const DEFAULT_HEALTH_CHECK_PORT: i32 = 9801;

pub fn default_proxy_image() -> String {
    "gcr.io/cloud-sql-connectors/cloud-sql-proxy:2.14.2".to_string()
}

pub fn default_proxy_resources() -> ResourceRequirements {
    let requests: BTreeMap<String, Quantity> = BTreeMap::from([
        ("cpu".to_owned(), Quantity("100m".to_string())),
        ("memory".to_owned(), Quantity("256Mi".to_string())),
    ]);
    ResourceRequirements {
        requests: Some(requests),
        ..ResourceRequirements::default()
    }
}

pub fn default_proxy_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        privileged: Some(false),
        read_only_root_filesystem: Some(true),
        run_as_non_root: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_security_context_is_restricted() {
        let sc = default_proxy_security_context();
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(
            sc.capabilities.unwrap().drop,
            Some(vec!["ALL".to_string()])
        );
    }
}
