use std::fmt;

/// Categories of proxy configuration problems reported through admission
/// responses and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    PortConflict,
    EnvVarConflict,
    FuseNotSupported,
    UnknownKind,
    InvalidConfig,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigErrorKind::PortConflict => "PortConflict",
            ConfigErrorKind::EnvVarConflict => "EnvVarConflict",
            ConfigErrorKind::FuseNotSupported => "FUSENotSupported",
            ConfigErrorKind::UnknownKind => "UnknownKind",
            ConfigErrorKind::InvalidConfig => "InvalidConfig",
        };
        f.write_str(s)
    }
}

/// One configuration problem, attributed to the AuthProxyWorkload that
/// declared it.
#[derive(Debug, Clone)]
pub struct ConfigErrorDetail {
    pub kind: ConfigErrorKind,
    pub namespace: String,
    pub name: String,
    pub message: String,
}

impl fmt::Display for ConfigErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on AuthProxyWorkload {}/{}: {}",
            self.kind, self.namespace, self.name, self.message
        )
    }
}

/// Accumulates every problem found while computing a pod-spec update so the
/// admission response can report all of them at once.
#[derive(Debug, Clone, Default)]
pub struct ConfigError {
    details: Vec<ConfigErrorDetail>,
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn add(&mut self, kind: ConfigErrorKind, namespace: &str, name: &str, message: String) {
        self.details.push(ConfigErrorDetail {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }

    pub fn details(&self) -> &[ConfigErrorDetail] {
        &self.details
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .details
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_every_detail() {
        let mut err = ConfigError::default();
        err.add(
            ConfigErrorKind::PortConflict,
            "default",
            "apw1",
            "proxy port 8081 for instance p:r:db is already in use".to_string(),
        );
        err.add(
            ConfigErrorKind::EnvVarConflict,
            "default",
            "apw2",
            "environment variable DB_PORT is already managed".to_string(),
        );
        let text = err.to_string();
        assert!(text.contains("PortConflict on AuthProxyWorkload default/apw1"));
        assert!(text.contains("EnvVarConflict on AuthProxyWorkload default/apw2"));
        assert_eq!(err.details().len(), 2);
    }

    #[test]
    fn fuse_kind_renders_upper_case() {
        assert_eq!(ConfigErrorKind::FuseNotSupported.to_string(), "FUSENotSupported");
    }
}
