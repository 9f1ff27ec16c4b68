//! Post-restore manifests
//!
//! A snapshot may carry a manifest template that personalises the restored
//! environment. It is rendered with `[[ ... ]]` variable delimiters so that
//! ordinary `{{ }}` content (Helm values, Go templates inside ConfigMaps)
//! passes through untouched, then applied with a short retry on conflicts.

use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use minijinja::syntax::SyntaxConfig;
use minijinja::{context, Environment, UndefinedBehavior};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use devenv_common::kube_utils::apply_manifests;
use devenv_common::retry::{retry_if, BackoffConfig};
use devenv_common::{Error, Result};

use crate::runtime::RuntimeConfig;

/// Applies rendered manifests to the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply a multi-document manifest
    async fn apply(&self, manifests: &str) -> Result<()>;
}

/// [`ManifestApplier`] using server-side apply
pub struct KubeApplier {
    client: Client,
}

impl KubeApplier {
    /// Applier for the given cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestApplier for KubeApplier {
    async fn apply(&self, manifests: &str) -> Result<()> {
        apply_manifests(&self.client, manifests).await
    }
}

/// Values available to the template
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateValues {
    /// Local user name
    pub user: String,
    /// Git email of the local user
    pub email: String,
    /// Runtime the cluster runs on
    pub cluster_runtime: RuntimeConfig,
}

impl TemplateValues {
    /// Collect values from the local machine
    pub async fn detect(cluster_runtime: RuntimeConfig) -> Result<Self> {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .map_err(|_| Error::validation("could not determine the current user"))?;

        let output = Command::new("git")
            .args(["config", "user.email"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::command(
                "git config user.email",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(Self {
            user,
            email: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            cluster_runtime,
        })
    }
}

/// Render a post-restore template.
///
/// Expressions may use a leading `.` for field access (`[[ .User ]]`) as
/// well as plain names (`[[ User ]]`). Undefined names are an error.
pub fn render(template: &str, values: &TemplateValues) -> Result<String> {
    let syntax = SyntaxConfig::builder()
        .variable_delimiters("[[", "]]")
        .block_delimiters("[%", "%]")
        .comment_delimiters("[#", "#]")
        .build()
        .map_err(|e| Error::internal_with_context("post_restore", e.to_string()))?;

    let mut env = Environment::new();
    env.set_syntax(syntax);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);

    let ctx = context! {
        User => values.user,
        Email => values.email,
        ClusterRuntime => context! {
            Name => values.cluster_runtime.name,
            Type => values.cluster_runtime.runtime_type.to_string(),
        },
    };

    env.render_str(&normalize_field_access(template), ctx)
        .map_err(|e| Error::serialization_for_kind("post-restore template", e.to_string()))
}

/// Strip the leading `.` of field paths inside `[[ ... ]]`.
///
/// `[[ .ClusterRuntime.Name ]]` becomes `[[ ClusterRuntime.Name ]]`; dots
/// after an identifier, a closing bracket or inside quotes are kept.
fn normalize_field_access(template: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut remaining = template;

    while let Some(start) = remaining.find("[[") {
        result.push_str(&remaining[..start + 2]);
        remaining = &remaining[start + 2..];

        let Some(end) = remaining.find("]]") else {
            break;
        };
        let mut prev: Option<char> = None;
        let mut quote: Option<char> = None;
        for c in remaining[..end].chars() {
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => {}
                None if c == '"' || c == '\'' => quote = Some(c),
                None if c == '.' && !prev.is_some_and(ends_path) => {
                    prev = Some(c);
                    continue;
                }
                None => {}
            }
            result.push(c);
            prev = Some(c);
        }
        result.push_str("]]");
        remaining = &remaining[end + 2..];
    }

    result.push_str(remaining);
    result
}

fn ends_path(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == ')' || c == ']'
}

/// Render `template` and apply it, retrying only on conflicts
pub async fn apply_post_restore(
    applier: &dyn ManifestApplier,
    template: &str,
    values: &TemplateValues,
    config: &BackoffConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let rendered = render(template, values)?;
    info!("Applying post-restore manifest(s)");

    retry_if(
        config,
        "apply_post_restore",
        cancel,
        || applier.apply(&rendered),
        Error::is_conflict,
    )
    .await?;
    Ok(())
}

/// 5 attempts, 1s apart
pub fn default_apply_backoff() -> BackoffConfig {
    BackoffConfig::new(Duration::from_secs(1), 5)
}
