//! S3 and GCS objects fetched through their HTTPS endpoints.
//!
//! Only anonymous S3 reads are covered. GCS requests carry a bearer token
//! when the task environment provides one.

use async_trait::async_trait;
use url::Url;

use super::http::HttpGetter;
use super::{Fetch, FetchRequest};
use crate::error::{Result, SandboxError};

const GCS_DOWNLOAD_HOST: &str = "storage.googleapis.com";

pub struct ObjectStoreGetter {
    kind: Store,
    bearer_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Store {
    S3,
    Gcs,
}

impl ObjectStoreGetter {
    pub fn s3() -> Self {
        Self {
            kind: Store::S3,
            bearer_token: None,
        }
    }

    pub fn gcs(bearer_token: Option<String>) -> Self {
        Self {
            kind: Store::Gcs,
            bearer_token,
        }
    }

    /// Maps the source onto the URL an anonymous or bearer-token GET can read.
    fn download_url(&self, source: &str) -> Result<String> {
        let mut url = Url::parse(source)
            .map_err(|e| SandboxError::transport(source, format!("invalid object URL: {e}")))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(SandboxError::UnsupportedSource(source.to_string()));
        }

        if self.kind == Store::Gcs && url.host_str() == Some("www.googleapis.com") {
            // https://www.googleapis.com/storage/v1/<bucket>/<object>
            let object = url
                .path()
                .strip_prefix("/storage/v1/")
                .filter(|rest| rest.contains('/'))
                .map(str::to_string)
                .ok_or_else(|| {
                    SandboxError::transport(source, "expected /storage/v1/<bucket>/<object>")
                })?;
            url.set_host(Some(GCS_DOWNLOAD_HOST))
                .map_err(|e| SandboxError::transport(source, e.to_string()))?;
            url.set_path(&object);
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl Fetch for ObjectStoreGetter {
    async fn fetch(&self, req: &FetchRequest) -> Result<()> {
        let mut req = req.clone();
        req.url = self.download_url(&req.url)?;
        if let Some(ref token) = self.bearer_token {
            req.headers
                .entry("Authorization".to_string())
                .or_insert_with(|| format!("Bearer {token}"));
        }
        HttpGetter::new(&req)?.fetch(&req).await
    }
}
