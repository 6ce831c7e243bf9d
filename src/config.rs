use crate::defaults;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub tls_cert: String,
    pub tls_key: String,
    pub proxy_image: String,
    pub opentelemetry_endpoint_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: from_env_default("SERVER_HOST", "0.0.0.0"),
            server_port: from_env_default("SERVER_PORT", "8443").parse().unwrap(),
            tls_cert: from_env_default("TLS_CERT", "/certs/tls.crt"),
            tls_key: from_env_default("TLS_KEY", "/certs/tls.key"),
            proxy_image: from_env_default("PROXY_IMAGE", &defaults::default_proxy_image()),
            opentelemetry_endpoint_url: {
                let url = env::var("OPENTELEMETRY_ENDPOINT_URL").unwrap_or_default();
                if url.is_empty() {
                    None
                } else {
                    Some(url)
                }
            },
        }
    }
}

fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}
