//! Application registry
//!
//! Records which applications are deployed in a devenv and at which
//! version. Velero restores cluster objects but has no notion of this
//! registry, so the restore flow snapshots it beforehand and reconciles it
//! afterwards.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use devenv_common::{Error, Result, DEVENV_NAMESPACE, FIELD_MANAGER};

/// Name of the registry ConfigMap
pub const APPS_CONFIGMAP: &str = "apps";

/// An application deployed in a devenv
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct App {
    /// Application name, matching its repository
    pub name: String,
    /// Deployed version
    pub version: String,
    /// When it was deployed
    pub deployed_at: DateTime<Utc>,
}

/// Storage for deployed application metadata
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppRegistry: Send + Sync {
    /// Every known application
    async fn list(&self) -> Result<Vec<App>>;

    /// One application, `None` if unknown
    async fn get(&self, name: &str) -> Result<Option<App>>;

    /// Insert or overwrite an application
    async fn set(&self, app: &App) -> Result<()>;

    /// Remove an application, `false` if it was not present
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Remove every application and the underlying storage
    async fn reset(&self) -> Result<()>;
}

/// [`AppRegistry`] stored in a ConfigMap, one JSON document per app
pub struct ConfigMapAppRegistry {
    client: Client,
    namespace: String,
}

impl ConfigMapAppRegistry {
    /// Registry in the default `devenv` namespace
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: DEVENV_NAMESPACE.to_string(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn load(&self) -> Result<BTreeMap<String, App>> {
        let Some(cm) = self.api().get_opt(APPS_CONFIGMAP).await? else {
            return Ok(BTreeMap::new());
        };
        cm.data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, json)| {
                let app: App = serde_json::from_str(&json).map_err(|e| {
                    Error::serialization_for_kind("apps", format!("entry {}: {}", key, e))
                })?;
                Ok((app.name.clone(), app))
            })
            .collect()
    }

    async fn save(&self, apps: &BTreeMap<String, App>) -> Result<()> {
        let data = apps
            .values()
            .map(|app| Ok((app.name.clone(), serde_json::to_string(app)?)))
            .collect::<Result<BTreeMap<String, String>>>()?;
        let cm = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": APPS_CONFIGMAP, "namespace": self.namespace },
            "data": data,
        });
        self.api()
            .patch(
                APPS_CONFIGMAP,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AppRegistry for ConfigMapAppRegistry {
    async fn list(&self) -> Result<Vec<App>> {
        Ok(self.load().await?.into_values().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<App>> {
        Ok(self.load().await?.remove(name))
    }

    async fn set(&self, app: &App) -> Result<()> {
        let mut apps = self.load().await?;
        apps.insert(app.name.clone(), app.clone());
        self.save(&apps).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut apps = self.load().await?;
        if apps.remove(name).is_none() {
            return Ok(false);
        }
        self.save(&apps).await?;
        Ok(true)
    }

    async fn reset(&self) -> Result<()> {
        match self
            .api()
            .delete(APPS_CONFIGMAP, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory [`AppRegistry`]
#[derive(Clone, Default)]
pub struct MemoryAppRegistry {
    apps: Arc<RwLock<BTreeMap<String, App>>>,
}

impl MemoryAppRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::internal_with_context("memory_app_registry", "lock poisoned")
    }
}

#[async_trait]
impl AppRegistry for MemoryAppRegistry {
    async fn list(&self) -> Result<Vec<App>> {
        Ok(self
            .apps
            .read()
            .map_err(|_| Self::poisoned())?
            .values()
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<App>> {
        Ok(self
            .apps
            .read()
            .map_err(|_| Self::poisoned())?
            .get(name)
            .cloned())
    }

    async fn set(&self, app: &App) -> Result<()> {
        self.apps
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(app.name.clone(), app.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self
            .apps
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(name)
            .is_some())
    }

    async fn reset(&self) -> Result<()> {
        self.apps.write().map_err(|_| Self::poisoned())?.clear();
        Ok(())
    }
}

/// Re-insert every app from `before` that is missing from the registry.
///
/// Apps present in both keep the version currently in the registry, which
/// after a restore is the version the snapshot carried. Returns the names
/// that were re-inserted.
pub async fn reconcile(before: &[App], registry: &dyn AppRegistry) -> Result<Vec<String>> {
    let current: BTreeMap<String, App> = registry
        .list()
        .await?
        .into_iter()
        .map(|a| (a.name.clone(), a))
        .collect();

    let mut restored = Vec::new();
    for app in before {
        if current.contains_key(&app.name) {
            debug!(app = %app.name, "App present after restore, keeping restored version");
            continue;
        }
        info!(app = %app.name, version = %app.version, "Re-adding app missing after restore");
        registry.set(app).await?;
        restored.push(app.name.clone());
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn app(name: &str, version: &str) -> App {
        App {
            name: name.to_string(),
            version: version.to_string(),
            deployed_at: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_wire_format_uses_snake_case_timestamp() {
        let json = serde_json::to_string(&app("flagship", "v1.2.3")).unwrap();
        assert!(json.contains("\"deployed_at\""));
        let parsed: App = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, app("flagship", "v1.2.3"));
    }

    #[tokio::test]
    async fn test_reconcile_restores_missing_and_keeps_restored_versions() {
        let registry = MemoryAppRegistry::new();
        registry.set(&app("app1", "v3")).await.unwrap();

        let before = vec![app("app1", "v1"), app("app2", "v2")];
        let restored = reconcile(&before, &registry).await.unwrap();
        assert_eq!(restored, vec!["app2".to_string()]);

        let mut after = registry.list().await.unwrap();
        after.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(after, vec![app("app1", "v3"), app("app2", "v2")]);
    }

    #[tokio::test]
    async fn test_reconcile_after_empty_restore() {
        let registry = MemoryAppRegistry::new();
        let before = vec![app("app1", "v1")];
        reconcile(&before, &registry).await.unwrap();
        assert_eq!(registry.get("app1").await.unwrap(), Some(app("app1", "v1")));
    }

    #[tokio::test]
    async fn test_reconcile_propagates_write_failures() {
        let mut registry = MockAppRegistry::new();
        registry.expect_list().returning(|| Ok(vec![]));
        registry
            .expect_set()
            .returning(|_| Err(Error::internal("apiserver unavailable")));

        let err = reconcile(&[app("app1", "v1")], &registry).await.unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test]
    async fn test_memory_registry_delete_and_reset() {
        let registry = MemoryAppRegistry::new();
        registry.set(&app("a", "1")).await.unwrap();
        registry.set(&app("b", "1")).await.unwrap();

        assert!(registry.delete("a").await.unwrap());
        assert!(!registry.delete("a").await.unwrap());

        registry.reset().await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
    }
}
