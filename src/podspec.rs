//! The pod-spec update algorithm shared by the reconciler and the admission
//! webhook: a deterministic, idempotent, reversible transformation of a pod
//! template against the set of AuthProxyWorkloads that match it.

use crate::{
    apis::authproxyworkload_types::{
        valid_connection_string, AuthProxyWorkload, InstanceSpec, RefreshStrategy, SocketType,
    },
    defaults,
    errors::{ConfigError, ConfigErrorKind},
    ledger::{ApwRef, Ledger, ManagedEnvVar, ManagedVolume},
    names,
    workload::Workload,
    Error, Result,
};
use itertools::Itertools;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, Volume, VolumeMount,
};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

/// Apply the set of matching AuthProxyWorkloads to a workload's pod template.
///
/// Returns true when the pod spec or the workload annotations changed.
/// Configuration problems abort the update before anything is written back,
/// so a rejected admission never persists a partial mutation.
pub fn configure_workload(
    workload: &mut Workload,
    matching: &[AuthProxyWorkload],
    default_image: &str,
) -> Result<bool> {
    // Owner-managed workloads belong to a higher-level controller and are
    // returned untouched
    if !workload.owner_references().is_empty() {
        return Ok(false);
    }

    let old = Ledger::from_annotations(workload.annotations());
    let mut spec = workload.pod_spec();
    let before_spec = serde_json::to_value(&spec).map_err(Error::SerializationError)?;
    let before_annotations = workload.annotations().cloned().unwrap_or_default();

    let mut apws: Vec<&AuthProxyWorkload> = matching.iter().collect();
    apws.sort_by_key(|a| (a.namespace().unwrap_or_default(), a.name_any()));

    let mut errors = ConfigError::default();
    let mut st = UpdateState::new(old.clone());

    let current_owners: Vec<ApwRef> = apws.iter().map(|a| apw_ref(a)).collect();
    st.mods.auth_proxy_workloads = current_owners.clone();

    // Ports already claimed by user containers are off limits
    for container in &spec.containers {
        if is_user_container(container) {
            for port in container.ports.iter().flatten() {
                st.mods.record_user_port(port.container_port, &container.name);
            }
        }
    }

    // Every port explicitly requested anywhere, so that implicit allocation
    // avoids them and colliding claims each get their own error record
    let mut explicit_claims: BTreeMap<i32, usize> = BTreeMap::new();
    let mut reserved: BTreeSet<i32> = BTreeSet::new();
    for apw in &apws {
        for instance in &apw.spec.instances {
            if instance.effective_socket_type() == SocketType::Tcp {
                if let Some(port) = instance.port {
                    *explicit_claims.entry(port).or_insert(0) += 1;
                    reserved.insert(port);
                }
            }
        }
        if let Some(port) = apw
            .spec
            .auth_proxy_container
            .as_ref()
            .and_then(|c| c.telemetry.as_ref())
            .and_then(|t| t.http_port)
        {
            reserved.insert(port);
        }
    }
    st.reserved = reserved;
    st.explicit_claims = explicit_claims;

    // Upsert one proxy container per matching AuthProxyWorkload
    let mut wanted: Vec<String> = Vec::new();
    for apw in &apws {
        let owner = apw_ref(apw);
        let container_name = names::container_name(&owner.namespace, &owner.name);
        let container = build_proxy_container(apw, &owner, &container_name, default_image, &mut st, &mut errors);
        match spec.containers.iter_mut().find(|c| c.name == container_name) {
            Some(existing) => *existing = container,
            None => spec.containers.push(container),
        }
        wanted.push(container_name);
    }

    // Drop sidecars whose AuthProxyWorkload no longer matches
    spec.containers.retain(|c| {
        is_user_container(c) || wanted.iter().any(|name| name == &c.name)
    });

    if !errors.is_empty() {
        return Err(Error::ProxyConfig(errors));
    }

    st.apply(&mut spec);

    // Stale annotation keys from AuthProxyWorkloads that moved away
    for stale in old
        .auth_proxy_workloads
        .iter()
        .filter(|r| !current_owners.contains(r))
    {
        workload.remove_annotation(&names::request_annotation(&stale.namespace, &stale.name));
        workload.remove_annotation(&names::result_annotation(&stale.namespace, &stale.name));
    }
    for apw in &apws {
        let owner = apw_ref(apw);
        let generation = apw.metadata.generation.unwrap_or(0);
        workload.set_annotation(
            &names::result_annotation(&owner.namespace, &owner.name),
            &generation.to_string(),
        );
    }
    if st.mods.auth_proxy_workloads.is_empty() {
        workload.remove_annotation(names::LEDGER_ANNOTATION);
    } else {
        let raw = st
            .mods
            .to_annotation_value()
            .map_err(Error::SerializationError)?;
        workload.set_annotation(names::LEDGER_ANNOTATION, &raw);
    }

    let after_spec = serde_json::to_value(&spec).map_err(Error::SerializationError)?;
    let spec_changed = before_spec != after_spec;
    if spec_changed {
        workload.set_pod_spec(spec);
    }
    let after_annotations = workload.annotations().cloned().unwrap_or_default();
    Ok(spec_changed || before_annotations != after_annotations)
}

fn apw_ref(apw: &AuthProxyWorkload) -> ApwRef {
    ApwRef::new(&apw.namespace().unwrap_or_default(), &apw.name_any())
}

fn is_user_container(container: &Container) -> bool {
    !container.name.starts_with(names::MANAGED_CONTAINER_PREFIX)
}

/// Build the proxy container for one AuthProxyWorkload, allocating ports and
/// recording env vars and volumes along the way. A full container override
/// replaces everything except the managed name.
fn build_proxy_container(
    apw: &AuthProxyWorkload,
    owner: &ApwRef,
    container_name: &str,
    default_image: &str,
    st: &mut UpdateState,
    errors: &mut ConfigError,
) -> Container {
    let proxy_spec = apw.spec.auth_proxy_container.as_ref();
    let telemetry = proxy_spec.and_then(|p| p.telemetry.as_ref());

    let health_port = st.allocate_health_port(owner, telemetry.and_then(|t| t.http_port), errors);

    let mut args: Vec<String> = vec![
        format!("--http-port={health_port}"),
        "--http-address=0.0.0.0".to_string(),
        "--health-check".to_string(),
        "--structured-logs".to_string(),
    ];
    if proxy_spec.and_then(|p| p.quiet).unwrap_or(false) {
        args.push("--quiet".to_string());
    }
    if let Some(t) = telemetry {
        if let Some(v) = &t.telemetry_project {
            args.push(format!("--telemetry-project={v}"));
        }
        if let Some(v) = &t.telemetry_prefix {
            args.push(format!("--telemetry-prefix={v}"));
        }
        if let Some(v) = t.telemetry_sample_rate {
            args.push(format!("--telemetry-sample-rate={v}"));
        }
        if t.disable_traces.unwrap_or(false) {
            args.push("--disable-traces".to_string());
        }
        if t.disable_metrics.unwrap_or(false) {
            args.push("--disable-metrics".to_string());
        }
        if t.prometheus.unwrap_or(false) {
            args.push("--prometheus".to_string());
        }
        if let Some(v) = &t.prometheus_namespace {
            args.push(format!("--prometheus-namespace={v}"));
        }
        if let Some(v) = &t.quota_project {
            args.push(format!("--quota-project={v}"));
        }
    }
    if let Some(p) = proxy_spec {
        if let Some(v) = p.max_connections {
            args.push(format!("--max-connections={v}"));
        }
        if let Some(v) = p.max_sigterm_delay {
            args.push(format!("--max-sigterm-delay={v}"));
        }
        if let Some(v) = &p.sql_admin_api_endpoint {
            args.push(format!("--sqladmin-api-endpoint={v}"));
        }
        if let Some(admin) = &p.admin_server {
            args.push(format!("--admin-port={}", admin.port));
            for api in &admin.enable_apis {
                match api.as_str() {
                    "Debug" => args.push("--debug".to_string()),
                    "QuitQuitQuit" => args.push("--quitquitquit".to_string()),
                    _ => {}
                }
            }
        }
        if let Some(auth) = &p.authentication {
            if !auth.impersonation_chain.is_empty() {
                args.push(format!(
                    "--impersonate-service-account={}",
                    auth.impersonation_chain.join(",")
                ));
            }
        }
    }
    if apw.refresh_strategy() == RefreshStrategy::Lazy {
        args.push("--lazy-refresh".to_string());
    }

    let mut volume_mounts: Vec<VolumeMount> = Vec::new();
    for instance in &apw.spec.instances {
        if let Some(arg) =
            instance_arg(instance, owner, container_name, st, &mut volume_mounts, errors)
        {
            args.push(arg);
        }
    }

    if let Some(override_container) = proxy_spec.and_then(|p| p.container.as_ref()) {
        let mut container = override_container.clone();
        container.name = container_name.to_string();
        return container;
    }

    Container {
        name: container_name.to_string(),
        image: Some(
            proxy_spec
                .and_then(|p| p.image.clone())
                .unwrap_or_else(|| default_image.to_string()),
        ),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args),
        resources: Some(
            proxy_spec
                .and_then(|p| p.resources.clone())
                .unwrap_or_else(defaults::default_proxy_resources),
        ),
        security_context: Some(
            proxy_spec
                .and_then(|p| p.security_context.clone())
                .unwrap_or_else(defaults::default_proxy_security_context),
        ),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    }
}

/// Produce the `connectionString?key=value&...` argument for one instance,
/// allocating its port or socket volume and recording requested env vars.
fn instance_arg(
    instance: &InstanceSpec,
    owner: &ApwRef,
    container_name: &str,
    st: &mut UpdateState,
    volume_mounts: &mut Vec<VolumeMount>,
    errors: &mut ConfigError,
) -> Option<String> {
    let conn = &instance.connection_string;
    if instance.fuse_dir.is_some() || instance.fuse_temp_dir.is_some() {
        errors.add(
            ConfigErrorKind::FuseNotSupported,
            &owner.namespace,
            &owner.name,
            format!("FUSE volumes are not supported for instance {conn}"),
        );
        return None;
    }
    if !valid_connection_string(conn) {
        errors.add(
            ConfigErrorKind::InvalidConfig,
            &owner.namespace,
            &owner.name,
            format!("connection string {conn:?} must take the form project:region:instance"),
        );
        return None;
    }

    let mut params: BTreeMap<&str, String> = BTreeMap::new();
    match instance.effective_socket_type() {
        SocketType::Tcp => {
            let port = st.allocate_instance_port(owner, conn, instance.port, errors);
            params.insert("port", port.to_string());
            if let Some(env_name) = &instance.host_env_name {
                st.add_env(owner, conn, env_name, "localhost", errors);
            }
            if let Some(env_name) = &instance.port_env_name {
                st.add_env(owner, conn, env_name, &port.to_string(), errors);
            }
        }
        SocketType::Unix => {
            let path = instance
                .unix_socket_path
                .clone()
                .unwrap_or_else(|| names::default_unix_socket_path(conn));
            params.insert("unix-socket", path.clone());
            let volume_name = names::unix_volume_name(container_name, conn);
            let volume_mount = VolumeMount {
                name: volume_name.clone(),
                mount_path: path.clone(),
                ..Default::default()
            };
            volume_mounts.push(volume_mount.clone());
            st.add_volume(ManagedVolume {
                auth_proxy_workload: owner.clone(),
                connection_string: conn.clone(),
                volume: Volume {
                    name: volume_name,
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                volume_mount,
            });
            if let Some(env_name) = &instance.unix_socket_path_env_name {
                st.add_env(owner, conn, env_name, &path, errors);
            }
        }
    }
    if let Some(b) = instance.auto_iam_auth_n {
        params.insert("auto-iam-authn", b.to_string());
    }
    if let Some(b) = instance.private_ip {
        params.insert("private-ip", b.to_string());
    }

    // BTreeMap iteration keeps the query keys sorted
    let query = params.iter().map(|(k, v)| format!("{k}={v}")).join("&");
    Some(format!("{conn}?{query}"))
}

/// Working state for one mutator run. `mods` is rebuilt from scratch while
/// `old` (the prior ledger) supplies stable port allocations and previously
/// recorded original values.
struct UpdateState {
    old: Ledger,
    mods: Ledger,
    reserved: BTreeSet<i32>,
    explicit_claims: BTreeMap<i32, usize>,
}

impl UpdateState {
    fn new(old: Ledger) -> Self {
        Self {
            old,
            mods: Ledger::default(),
            reserved: BTreeSet::new(),
            explicit_claims: BTreeMap::new(),
        }
    }

    fn allocate_health_port(
        &mut self,
        owner: &ApwRef,
        explicit: Option<i32>,
        errors: &mut ConfigError,
    ) -> i32 {
        if let Some(port) = explicit {
            if self.mods.port_in_use(port) {
                errors.add(
                    ConfigErrorKind::PortConflict,
                    &owner.namespace,
                    &owner.name,
                    format!("telemetry http port {port} is already in use"),
                );
            }
            self.mods.record_owned_port(owner, None, port);
            return port;
        }
        if let Some(prev) = self.old.owned_port(owner, None) {
            if !self.mods.port_in_use(prev) && !self.reserved.contains(&prev) {
                self.mods.record_owned_port(owner, None, prev);
                return prev;
            }
        }
        let port = self.scan_free_port(defaults::DEFAULT_HEALTH_CHECK_PORT);
        self.mods.record_owned_port(owner, None, port);
        port
    }

    fn allocate_instance_port(
        &mut self,
        owner: &ApwRef,
        connection_string: &str,
        explicit: Option<i32>,
        errors: &mut ConfigError,
    ) -> i32 {
        if let Some(port) = explicit {
            let claimed_elsewhere = self.explicit_claims.get(&port).copied().unwrap_or(0) > 1;
            let in_use = self.mods.ports.iter().any(|p| {
                p.port == port
                    && !(p.auth_proxy_workload.as_ref() == Some(owner)
                        && p.connection_string.as_deref() == Some(connection_string))
            });
            if claimed_elsewhere || in_use {
                errors.add(
                    ConfigErrorKind::PortConflict,
                    &owner.namespace,
                    &owner.name,
                    format!(
                        "proxy port {port} for instance {connection_string} is already in use"
                    ),
                );
            }
            self.mods
                .record_owned_port(owner, Some(connection_string), port);
            return port;
        }
        if let Some(prev) = self.old.owned_port(owner, Some(connection_string)) {
            if !self.mods.port_in_use(prev) && !self.reserved.contains(&prev) {
                self.mods
                    .record_owned_port(owner, Some(connection_string), prev);
                return prev;
            }
        }
        let port = self.scan_free_port(defaults::DEFAULT_FIRST_PORT);
        self.mods
            .record_owned_port(owner, Some(connection_string), port);
        port
    }

    fn scan_free_port(&self, first: i32) -> i32 {
        let mut port = first;
        while self.mods.port_in_use(port) || self.reserved.contains(&port) {
            port += 1;
        }
        port
    }

    fn add_env(
        &mut self,
        owner: &ApwRef,
        connection_string: &str,
        name: &str,
        value: &str,
        errors: &mut ConfigError,
    ) {
        if let Some(existing) = self.mods.env_var(name) {
            if existing.operator_managed_value.value.as_deref() == Some(value) {
                return;
            }
            let other = existing.auth_proxy_workload.clone();
            errors.add(
                ConfigErrorKind::EnvVarConflict,
                &owner.namespace,
                &owner.name,
                format!(
                    "environment variable {} is already set to a different value by AuthProxyWorkload {}/{}",
                    name, other.namespace, other.name
                ),
            );
            return;
        }
        let mut entry = ManagedEnvVar {
            auth_proxy_workload: owner.clone(),
            connection_string: connection_string.to_string(),
            operator_managed_value: EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                value_from: None,
            },
            original_values: BTreeMap::new(),
        };
        // originals recorded on an earlier run survive spec changes
        if let Some(prev) = self
            .old
            .env_vars
            .iter()
            .find(|e| e.auth_proxy_workload == *owner && e.operator_managed_value.name == name)
        {
            entry.original_values = prev.original_values.clone();
        }
        self.mods.env_vars.push(entry);
    }

    fn add_volume(&mut self, managed: ManagedVolume) {
        self.mods.record_volume(managed);
    }

    /// Project the recorded env vars and volume mounts onto every user
    /// container, restore values owned by departed AuthProxyWorkloads, and
    /// prune stale volumes from the pod spec.
    fn apply(&mut self, spec: &mut PodSpec) {
        let UpdateState { old, mods, .. } = self;

        for container in spec.containers.iter_mut().filter(|c| is_user_container(c)) {
            // set or overwrite managed env vars, remembering what they replace
            for entry in mods.env_vars.iter_mut() {
                let env = container.env.get_or_insert_with(Vec::new);
                match env
                    .iter_mut()
                    .find(|e| e.name == entry.operator_managed_value.name)
                {
                    Some(existing) => {
                        if existing.value == entry.operator_managed_value.value
                            && existing.value_from.is_none()
                        {
                            continue;
                        }
                        let was_ours = old.env_vars.iter().any(|o| {
                            o.operator_managed_value.name == entry.operator_managed_value.name
                                && o.operator_managed_value.value == existing.value
                        });
                        if !was_ours && !entry.original_values.contains_key(&container.name) {
                            entry.original_values.insert(
                                container.name.clone(),
                                existing.value.clone().unwrap_or_default(),
                            );
                        }
                        existing.value = entry.operator_managed_value.value.clone();
                        existing.value_from = None;
                    }
                    None => env.push(entry.operator_managed_value.clone()),
                }
            }

            // env vars we managed before but no longer do: restore or drop
            for old_entry in &old.env_vars {
                let name = &old_entry.operator_managed_value.name;
                if mods
                    .env_vars
                    .iter()
                    .any(|e| &e.operator_managed_value.name == name)
                {
                    continue;
                }
                if let Some(env) = container.env.as_mut() {
                    if let Some(pos) = env.iter().position(|e| &e.name == name) {
                        match old_entry.original_values.get(&container.name) {
                            Some(original) => {
                                env[pos].value = Some(original.clone());
                                env[pos].value_from = None;
                            }
                            None => {
                                env.remove(pos);
                            }
                        }
                    }
                }
            }
            if container.env.as_ref().is_some_and(|e| e.is_empty()) {
                container.env = None;
            }
        }

        // volumes and mounts
        let current_volumes: BTreeSet<&str> = mods
            .volume_mounts
            .iter()
            .map(|v| v.volume.name.as_str())
            .collect();
        let stale_volumes: Vec<String> = old
            .volume_mounts
            .iter()
            .map(|v| v.volume.name.clone())
            .filter(|name| !current_volumes.contains(name.as_str()))
            .collect();

        for container in spec.containers.iter_mut() {
            if is_user_container(container) {
                for managed in mods.volume_mounts.iter() {
                    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
                    match mounts
                        .iter_mut()
                        .find(|m| m.name == managed.volume_mount.name)
                    {
                        Some(existing) => *existing = managed.volume_mount.clone(),
                        None => mounts.push(managed.volume_mount.clone()),
                    }
                }
            }
            if let Some(mounts) = container.volume_mounts.as_mut() {
                mounts.retain(|m| !stale_volumes.contains(&m.name));
                if mounts.is_empty() {
                    container.volume_mounts = None;
                }
            }
        }

        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        for managed in mods.volume_mounts.iter() {
            match volumes.iter_mut().find(|v| v.name == managed.volume.name) {
                Some(existing) => *existing = managed.volume.clone(),
                None => volumes.push(managed.volume.clone()),
            }
        }
        volumes.retain(|v| !stale_volumes.contains(&v.name));
        if volumes.is_empty() {
            spec.volumes = None;
        }
    }
}
