use sha2::{Digest, Sha256};

/// Name prefix that marks a container as operator managed.
pub const MANAGED_CONTAINER_PREFIX: &str = "csql-";
/// Annotation prefix for the generation the reconciler asked the webhook to apply.
pub const REQUEST_ANNOTATION_PREFIX: &str = "csqlr-";
/// Annotation prefix for the generation the webhook last applied.
pub const RESULT_ANNOTATION_PREFIX: &str = "csqlu-";
/// Annotation holding the modification ledger.
pub const LEDGER_ANNOTATION: &str = "csql-env";

// Container, volume, and annotation-key names must fit in a DNS label
const MAX_LABEL_LEN: usize = 63;
const ANNOTATION_HASH_LEN: usize = 14;
const NAME_HASH_LEN: usize = 8;

pub fn short_hash(input: &str, len: usize) -> String {
    let digest = format!("{:x}", Sha256::digest(input.as_bytes()));
    digest[..len].to_string()
}

// Bound a candidate name to 63 chars, keeping a hash suffix so truncated
// names stay unique per input.
fn bounded(candidate: String) -> String {
    if candidate.len() <= MAX_LABEL_LEN {
        return candidate;
    }
    let hash = short_hash(&candidate, NAME_HASH_LEN);
    format!(
        "{}-{}",
        &candidate[..MAX_LABEL_LEN - NAME_HASH_LEN - 1],
        hash
    )
}

/// Name of the proxy container owned by the AuthProxyWorkload `namespace/name`.
pub fn container_name(namespace: &str, name: &str) -> String {
    bounded(format!("{MANAGED_CONTAINER_PREFIX}{namespace}-{name}"))
}

pub fn request_annotation(namespace: &str, name: &str) -> String {
    format!(
        "{}{}",
        REQUEST_ANNOTATION_PREFIX,
        short_hash(&format!("{namespace}/{name}"), ANNOTATION_HASH_LEN)
    )
}

pub fn result_annotation(namespace: &str, name: &str) -> String {
    format!(
        "{}{}",
        RESULT_ANNOTATION_PREFIX,
        short_hash(&format!("{namespace}/{name}"), ANNOTATION_HASH_LEN)
    )
}

/// Name of the emptyDir volume shared between a proxy container and the
/// user containers for one unix-socket instance.
pub fn unix_volume_name(container_name: &str, connection_string: &str) -> String {
    bounded(format!(
        "{}-{}-unix",
        container_name,
        short_hash(connection_string, NAME_HASH_LEN)
    ))
}

/// Socket directory used when the instance does not set one explicitly.
pub fn default_unix_socket_path(connection_string: &str) -> String {
    format!("/csql/{}", short_hash(connection_string, NAME_HASH_LEN))
}
