// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Object store uploads for etcd snapshots.
//!
//! [`HttpObjectStore`] talks to any S3-compatible store. Each upload is a
//! path-style `PUT {endpoint}/{bucket}/{key}` to a URL presigned with AWS
//! Signature Version 4, so the access key pair never leaves the operator.
//! Throttling and server errors are retried with the HTTP backoff, other
//! rejections fail immediately.

use crate::constants::{ETCD_BACKUP_KEY_PREFIX, OBJECT_STORE_PRESIGN_TTL_SECS};
use crate::errors::ObjectStoreError;
use crate::reconcilers::retry::{http_backoff, is_retryable_http_status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client as HttpClient, StatusCode};
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Destination bucket and credentials of an upload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct S3Target {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint. `https://s3.<region>.amazonaws.com` when unset.
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub insecure_skip_tls_verify: bool,
}

impl S3Target {
    /// Path-style bucket handle of the target.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::InvalidEndpoint`] for an endpoint without scheme,
    /// an unparsable endpoint or an empty bucket.
    pub fn bucket(&self) -> Result<Bucket, ObjectStoreError> {
        let endpoint = match self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.region),
        };
        let invalid = |reason: String| ObjectStoreError::InvalidEndpoint {
            endpoint: endpoint.clone(),
            reason,
        };
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(invalid("missing http:// or https:// scheme".to_string()));
        }
        if self.bucket.is_empty() {
            return Err(invalid("bucket name is required".to_string()));
        }
        let url = Url::parse(&endpoint).map_err(|e| invalid(e.to_string()))?;
        Bucket::new(url, UrlStyle::Path, self.bucket.clone(), self.region.clone())
            .map_err(|e| invalid(e.to_string()))
    }

    /// Unsigned URL of `key` in the target bucket.
    ///
    /// # Errors
    ///
    /// See [`S3Target::bucket`].
    pub fn object_url(&self, key: &str) -> Result<String, ObjectStoreError> {
        let bucket = self.bucket()?;
        bucket
            .object_url(key.trim_start_matches('/'))
            .map(String::from)
            .map_err(|e| ObjectStoreError::InvalidEndpoint {
                endpoint: bucket.base_url().to_string(),
                reason: e.to_string(),
            })
    }

    /// SigV4-presigned `PUT` URL of `key`, valid for `expires_in`.
    ///
    /// # Errors
    ///
    /// See [`S3Target::bucket`].
    pub fn presigned_put(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<Url, ObjectStoreError> {
        let bucket = self.bucket()?;
        let credentials = Credentials::new(&self.access_key_id, &self.secret_access_key);
        Ok(bucket
            .put_object(Some(&credentials), key.trim_start_matches('/'))
            .sign(expires_in))
    }
}

/// Object key of an etcd snapshot of `cluster` taken at `taken_at`.
#[must_use]
pub fn snapshot_key(cluster: &str, taken_at: DateTime<Utc>) -> String {
    format!(
        "{ETCD_BACKUP_KEY_PREFIX}/{cluster}/etcd-snapshot-{}.db",
        taken_at.format("%Y%m%dT%H%M%SZ")
    )
}

/// Stores objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads `body` under `key`.
    async fn upload(
        &self,
        target: &S3Target,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), ObjectStoreError>;
}

/// S3-compatible object store using presigned `PUT` requests.
#[derive(Clone, Debug)]
pub struct HttpObjectStore {
    client: HttpClient,
}

impl HttpObjectStore {
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    fn client_for(&self, target: &S3Target, url: &str) -> Result<HttpClient, ObjectStoreError> {
        if !target.insecure_skip_tls_verify {
            return Ok(self.client.clone());
        }
        HttpClient::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ObjectStoreError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn put_once(
        client: &HttpClient,
        url: &Url,
        body: Vec<u8>,
    ) -> Result<(), (Option<StatusCode>, ObjectStoreError)> {
        let response = client
            .put(url.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| {
                (
                    None,
                    ObjectStoreError::Request {
                        url: redacted(url),
                        reason: e.to_string(),
                    },
                )
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err((
            Some(status),
            ObjectStoreError::Rejected {
                url: redacted(url),
                status: status.as_u16(),
            },
        ))
    }
}

/// `url` without its query, which carries the signature.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(
        &self,
        target: &S3Target,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), ObjectStoreError> {
        let expires_in = Duration::from_secs(OBJECT_STORE_PRESIGN_TTL_SECS);
        let url = target.presigned_put(key, expires_in)?;
        let display_url = redacted(&url);
        let client = self.client_for(target, &display_url)?;
        let mut backoff = http_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match Self::put_once(&client, &url, body.clone()).await {
                Ok(()) => {
                    debug!(url = %display_url, attempt, "Object uploaded");
                    return Ok(());
                }
                Err((status, error)) => {
                    let retryable = status.is_none_or(is_retryable_http_status);
                    let delay = if retryable { backoff.next_backoff() } else { None };
                    let Some(delay) = delay else {
                        return Err(error);
                    };
                    warn!(
                        url = %display_url,
                        attempt,
                        retry_after = ?delay,
                        error = %error,
                        "Retryable upload error, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "object_store_tests.rs"]
mod object_store_tests;
