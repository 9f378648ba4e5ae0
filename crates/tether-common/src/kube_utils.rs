//! Kubernetes client helpers
//!
//! Client construction for the local cluster, kubeconfig extraction from
//! credential secrets, and a stable content hash for annotations.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_yaml::Value;

use crate::{Error, KUBECONFIG_KEY};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// User-entry fields that may name a file; each maps to its inline `-data` field
const FILE_REFERENCES: &[(&str, &str)] = &[
    ("client-certificate", "client-certificate-data"),
    ("client-key", "client-key-data"),
];

/// Create a kube client from an optional kubeconfig path, else in-cluster/env config
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Read a single data key from a secret
pub fn secret_data<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.as_slice())
}

/// Parse the kubeconfig stored in a credential secret.
///
/// The `kubeconfig` key is required. A user entry whose `client-certificate`
/// or `client-key` names another key of the same secret gets that key's bytes
/// inlined as `client-certificate-data` / `client-key-data`.
pub fn load_kubeconfig_from_secret(secret: &Secret) -> Result<Kubeconfig, Error> {
    let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
    let name = secret.metadata.name.as_deref().unwrap_or_default();

    let raw = secret_data(secret, KUBECONFIG_KEY).ok_or_else(|| {
        Error::config(format!(
            "unable to find kubeconfig in secret {:?} {:?}",
            namespace, name
        ))
    })?;

    let mut doc: Value = serde_yaml::from_slice(raw).map_err(|e| {
        Error::config(format!(
            "invalid kubeconfig in secret {:?} {:?}: {}",
            namespace, name, e
        ))
    })?;

    if let Some(users) = doc.get_mut("users").and_then(Value::as_sequence_mut) {
        for user in users.iter_mut().filter_map(|u| u.get_mut("user")) {
            inline_file_references(user, secret);
        }
    }

    serde_yaml::from_value(doc).map_err(|e| {
        Error::config(format!(
            "invalid kubeconfig in secret {:?} {:?}: {}",
            namespace, name, e
        ))
    })
}

fn inline_file_references(user: &mut Value, secret: &Secret) {
    let Some(map) = user.as_mapping_mut() else {
        return;
    };

    for (path_field, data_field) in FILE_REFERENCES {
        let Some(file) = map.get(*path_field).and_then(Value::as_str) else {
            continue;
        };
        if file.is_empty() {
            continue;
        }
        if let Some(bytes) = secret_data(secret, file) {
            let encoded = STANDARD.encode(bytes);
            map.remove(*path_field);
            map.insert(Value::from(*data_field), Value::from(encoded));
        }
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256; stable across toolchains so it is safe to persist in annotations.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}
