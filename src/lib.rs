/// Reconciler, shared state, and the controller entry point
pub mod controller;
pub use crate::controller::*;
pub mod apis;

pub mod config;
pub mod defaults;
pub mod errors;
pub mod ledger;
pub mod names;
pub mod podspec;
pub mod telemetry;
pub mod webhook;
pub mod workload;

mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod fixtures;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // finalizer::Error is generic over this same enum; the Box keeps the
    // type from being infinitely sized
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("unsupported resource kind: {0}")]
    UnknownKind(String),

    #[error("Invalid workload selector: {0}")]
    InvalidSelector(String),

    #[error("{0}")]
    ProxyConfig(#[from] errors::ConfigError),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}
