//! S3-compatible object store
//!
//! Used for the remote snapshot bucket (AWS S3) and the in-cluster minio
//! buckets. Path-style addressing is always enabled so that minio endpoints
//! work without DNS wildcards.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use devenv_common::{Error, Result};

use crate::digest;
use crate::store::{ByteChunks, ObjectInfo, ObjectStore};

/// Endpoint used when none is configured
pub const DEFAULT_S3_HOST: &str = "https://s3.amazonaws.com";

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Connection and selection settings for one side of a staging run.
///
/// Serialized as part of the stager's `CONFIG` environment variable.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    /// Endpoint, optionally prefixed with `http://` or `https://`
    #[serde(default)]
    pub s3_host: String,
    /// Bucket name
    #[serde(default)]
    pub bucket: String,
    /// Pinned object key; empty means discover through the lock registry
    #[serde(default)]
    pub key: String,
    /// Expected digest of the pinned key
    #[serde(default)]
    pub digest: String,
    /// Snapshot target to discover
    #[serde(default)]
    pub snapshot_target: String,
    /// Release channel to discover
    #[serde(default)]
    pub snapshot_channel: String,
    /// Access key id
    #[serde(default)]
    pub aws_access_key: String,
    /// Secret access key
    #[serde(default)]
    pub aws_secret_key: String,
    /// Optional session token
    #[serde(default)]
    pub aws_session_token: String,
    /// Region
    #[serde(default)]
    pub region: String,
}

impl S3Config {
    /// Endpoint URL with an explicit scheme
    ///
    /// An empty host means AWS S3. A bare host without scheme is plain HTTP.
    pub fn endpoint_url(&self) -> String {
        let host = if self.s3_host.is_empty() {
            DEFAULT_S3_HOST
        } else {
            self.s3_host.as_str()
        };
        if host.starts_with("https://") || host.starts_with("http://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        }
    }

    /// Whether the endpoint uses TLS
    pub fn is_secure(&self) -> bool {
        self.endpoint_url().starts_with("https://")
    }

    fn region_or_default(&self) -> String {
        if self.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            self.region.clone()
        }
    }
}

/// [`ObjectStore`] backed by an S3-compatible API
#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Connect with the static credentials in `config`
    pub fn from_config(config: &S3Config) -> Self {
        let session_token = if config.aws_session_token.is_empty() {
            None
        } else {
            Some(config.aws_session_token.clone())
        };
        let credentials = Credentials::new(
            config.aws_access_key.clone(),
            config.aws_secret_key.clone(),
            session_token,
            None,
            "devenv-static",
        );
        let conf = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region_or_default()))
            .endpoint_url(config.endpoint_url())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(conf),
            bucket: config.bucket.clone(),
        }
    }

    /// Connect with the ambient AWS credential chain (env, profile, SSO)
    pub async fn from_env(bucket: &str, region: &str, endpoint: Option<&str>) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
        }
    }

    fn classify<E>(&self, operation: &str, key: &str, err: E) -> Error
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        match err.code() {
            Some("NoSuchKey") | Some("NotFound") => Error::ObjectNotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            },
            Some("AccessDenied")
            | Some("InvalidAccessKeyId")
            | Some("SignatureDoesNotMatch")
            | Some("ExpiredToken") => Error::StorageAuth {
                bucket: self.bucket.clone(),
                message: format!("{}", DisplayErrorContext(&err)),
            },
            _ => Error::storage(
                operation,
                &self.bucket,
                format!("{} {}: {}", operation, key, DisplayErrorContext(&err)),
            ),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.classify("get", key, e))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::storage("get", &self.bucket, format!("{}: {}", key, e)))?;
        Ok(data.into_bytes())
    }

    async fn get_stream(&self, key: &str) -> Result<ByteChunks> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.classify("get", key, e))?;

        let bucket = self.bucket.clone();
        let stream = futures::stream::unfold(resp.body, move |mut body| {
            let bucket = bucket.clone();
            async move {
                body.next().await.map(|chunk| {
                    let chunk = chunk.map_err(|e| Error::storage("get", bucket, e.to_string()));
                    (chunk, body)
                })
            }
        });
        Ok(stream.boxed())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let content_md5 = digest::content_md5(&data);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(content_md5)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.classify("put", key, e))?;
        debug!(bucket = %self.bucket, key = %key, "Put object");
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path, content_md5: &str) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Error::storage("put", &self.bucket, e.to_string()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(content_md5)
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify("put", key, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| self.classify("list", prefix, e))?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                if key.is_empty() {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or_default().max(0) as u64,
                });
            }
        }
        Ok(objects)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.classify("remove", key, e))?;
        Ok(())
    }
}
