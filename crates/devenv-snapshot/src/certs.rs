//! Certificate regeneration
//!
//! Restored certificates were issued by the CA of the cluster the snapshot
//! was taken from. Marking every cert-manager Certificate as issuing makes
//! cert-manager reissue them from the local CA.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use devenv_common::kube_utils::build_api_resource;
use devenv_common::retry::{retry_if, BackoffConfig};
use devenv_common::{Error, Result};

/// Condition cert-manager watches to start issuance
pub const ISSUING_CONDITION: &str = "Issuing";

/// Delay between renewal attempts after a conflict
pub const RENEW_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Triggers reissuance of certificates
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateRenewer: Send + Sync {
    /// Mark every certificate in every namespace for reissuance.
    ///
    /// Returns how many certificates were marked.
    async fn renew_all(&self) -> Result<usize>;
}

/// [`CertificateRenewer`] for cert-manager `Certificate` resources
pub struct CertManagerRenewer {
    client: Client,
    resource: ApiResource,
}

impl CertManagerRenewer {
    /// Renewer for the given cluster
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: build_api_resource("cert-manager.io/v1", "Certificate"),
        }
    }
}

#[async_trait]
impl CertificateRenewer for CertManagerRenewer {
    async fn renew_all(&self) -> Result<usize> {
        let all: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.resource);
        let certs = all.list(&ListParams::default()).await?;

        let mut renewed = 0;
        for cert in certs.items {
            let (Some(name), Some(namespace)) =
                (cert.metadata.name.clone(), cert.metadata.namespace.clone())
            else {
                continue;
            };

            let mut value = serde_json::to_value(&cert)?;
            if !mark_issuing(&mut value, Utc::now()) {
                debug!(namespace = %namespace, certificate = %name, "Certificate already issuing");
                continue;
            }

            // replace_status carries the resourceVersion, so a concurrent
            // update by cert-manager surfaces as a 409.
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &namespace, &self.resource);
            api.replace_status(&name, &PostParams::default(), serde_json::to_vec(&value)?)
                .await?;
            renewed += 1;
        }
        Ok(renewed)
    }
}

/// Set `Issuing=True` on a Certificate object.
///
/// Returns `false` without modifying anything if the condition is already
/// true.
pub fn mark_issuing(cert: &mut Value, now: DateTime<Utc>) -> bool {
    let generation = cert.pointer("/metadata/generation").cloned();

    let Some(obj) = cert.as_object_mut() else {
        return false;
    };
    let status = obj.entry("status").or_insert_with(|| json!({}));
    if !status.is_object() {
        *status = json!({});
    }
    let Some(status) = status.as_object_mut() else {
        return false;
    };
    let conditions = status.entry("conditions").or_insert_with(|| json!([]));
    if !conditions.is_array() {
        *conditions = json!([]);
    }
    let Some(conditions) = conditions.as_array_mut() else {
        return false;
    };

    let already = conditions.iter().any(|c| {
        c.get("type").and_then(Value::as_str) == Some(ISSUING_CONDITION)
            && c.get("status").and_then(Value::as_str) == Some("True")
    });
    if already {
        return false;
    }

    conditions.retain(|c| c.get("type").and_then(Value::as_str) != Some(ISSUING_CONDITION));
    let mut condition = json!({
        "type": ISSUING_CONDITION,
        "status": "True",
        "reason": "ManuallyTriggered",
        "message": "Certificate re-issuance manually triggered",
        "lastTransitionTime": now.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    if let Some(generation) = generation {
        condition["observedGeneration"] = generation;
    }
    conditions.push(condition);
    true
}

/// Renew every certificate, retrying conflicts until cancelled.
///
/// Any error other than a conflict is returned immediately.
pub async fn renew_certificates(
    renewer: &dyn CertificateRenewer,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<usize> {
    info!("Regenerating certificates with local CA");
    let renewed = retry_if(
        &BackoffConfig::unbounded(interval),
        "renew_certificates",
        cancel,
        || renewer.renew_all(),
        Error::is_conflict,
    )
    .await?;
    info!(renewed, "Triggered certificate regeneration");
    Ok(renewed)
}
