//! Transport selection for artifact sources.
//!
//! A source string is mapped to exactly one [`Transport`] by a pure
//! detection function. A `kind::` prefix (`git::`, `hg::`, `s3::`, `gcs::`)
//! forces the choice, otherwise the URL shape decides.

pub mod http;
pub mod object_store;
pub mod vcs;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};

pub use http::HttpGetter;
pub use object_store::ObjectStoreGetter;
pub use vcs::{GitGetter, HgGetter};

/// Everything a transport needs to materialize one source.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Source with the forced prefix and getter options removed.
    pub url: String,
    /// Output path: a file for downloads, a directory for clones.
    pub dest: PathBuf,
    pub timeout: Duration,
    pub max_bytes: u64,
    pub insecure: bool,
    pub headers: BTreeMap<String, String>,
    pub options: SourceOptions,
}

/// Query parameters interpreted by the getter rather than the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceOptions {
    /// `archive=` override: `false` disables extraction, otherwise a format name.
    pub archive: Option<String>,
    /// Git `ref=` / Mercurial `rev=`
    pub revision: Option<String>,
    /// Git `depth=`
    pub depth: Option<u32>,
}

/// Capability shared by every transport backend.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Retrieves `req.url` into `req.dest`.
    async fn fetch(&self, req: &FetchRequest) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Git,
    Hg,
    S3,
    Gcs,
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Git => "git",
            Transport::Hg => "hg",
            Transport::S3 => "s3",
            Transport::Gcs => "gcs",
        }
    }

    /// Per-transport deadline from the process configuration.
    pub fn timeout(&self, config: &SandboxConfig) -> Duration {
        match self {
            Transport::Http => config.http_read_timeout,
            Transport::Git => config.git_timeout,
            Transport::Hg => config.hg_timeout,
            Transport::S3 => config.s3_timeout,
            Transport::Gcs => config.gcs_timeout,
        }
    }

    /// Whether the transport produces a directory rather than a single file.
    pub fn produces_tree(&self) -> bool {
        matches!(self, Transport::Git | Transport::Hg)
    }

    /// Fetches through the backend for this transport.
    pub async fn fetch(&self, req: &FetchRequest, bearer_token: Option<String>) -> Result<()> {
        match self {
            Transport::Http => HttpGetter::new(req)?.fetch(req).await,
            Transport::Git => GitGetter.fetch(req).await,
            Transport::Hg => HgGetter.fetch(req).await,
            Transport::S3 => ObjectStoreGetter::s3().fetch(req).await,
            Transport::Gcs => ObjectStoreGetter::gcs(bearer_token).fetch(req).await,
        }
    }
}

/// A source string split into transport, URL and getter options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub transport: Transport,
    pub url: String,
    pub options: SourceOptions,
}

const FORCED_PREFIXES: [(&str, Transport); 4] = [
    ("git::", Transport::Git),
    ("hg::", Transport::Hg),
    ("s3::", Transport::S3),
    ("gcs::", Transport::Gcs),
];

impl Source {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SandboxError::UnsupportedSource("empty source".to_string()));
        }

        let (transport, rest) = match FORCED_PREFIXES
            .iter()
            .find_map(|(prefix, t)| raw.strip_prefix(prefix).map(|rest| (*t, rest)))
        {
            Some((t, rest)) => (t, normalize_shorthand(rest)),
            None => {
                let url = normalize_shorthand(raw);
                (detect(&url).ok_or_else(|| SandboxError::UnsupportedSource(raw.to_string()))?, url)
            }
        };

        let (url, options) = split_options(&rest, transport);
        Ok(Self {
            transport,
            url,
            options,
        })
    }

    /// File name for a downloaded object, taken from the last URL path segment.
    pub fn file_name(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segs| segs.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .unwrap_or_else(|| "download".to_string())
    }
}

/// Adds a scheme to host-only shorthands like `github.com/org/repo`.
fn normalize_shorthand(source: &str) -> String {
    if source.contains("://") || source.starts_with('/') || is_scp_like(source) {
        return source.to_string();
    }
    let host = source.split('/').next().unwrap_or("");
    if host.contains('.') {
        format!("https://{source}")
    } else {
        source.to_string()
    }
}

/// `git@github.com:org/repo.git`
fn is_scp_like(source: &str) -> bool {
    match source.split_once(':') {
        Some((user_host, _)) => user_host.contains('@') && !user_host.contains('/'),
        None => false,
    }
}

fn detect(source: &str) -> Option<Transport> {
    if is_scp_like(source) {
        return Some(Transport::Git);
    }
    let url = Url::parse(source).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str().unwrap_or("");
    let path = url.path();

    if host.ends_with("amazonaws.com") && (host.starts_with("s3") || host.contains(".s3")) {
        return Some(Transport::S3);
    }
    if host == "storage.googleapis.com"
        || (host == "www.googleapis.com" && path.starts_with("/storage/"))
    {
        return Some(Transport::Gcs);
    }
    if path.ends_with(".git")
        || ((host == "github.com" || host == "gitlab.com") && path.split('/').filter(|s| !s.is_empty()).count() == 2)
    {
        return Some(Transport::Git);
    }
    Some(Transport::Http)
}

/// Removes getter-specific query parameters and returns them as options.
fn split_options(source: &str, transport: Transport) -> (String, SourceOptions) {
    let mut options = SourceOptions::default();
    let Ok(mut url) = Url::parse(source) else {
        return (source.to_string(), options);
    };
    if url.query().is_none() {
        return (source.to_string(), options);
    }

    let mut kept = Vec::new();
    for (key, value) in url.query_pairs() {
        match (key.as_ref(), transport) {
            ("archive", _) => options.archive = Some(value.into_owned()),
            ("ref", Transport::Git) | ("rev", Transport::Hg) => {
                options.revision = Some(value.into_owned())
            }
            ("depth", Transport::Git) => options.depth = value.parse().ok(),
            _ => kept.push((key.into_owned(), value.into_owned())),
        }
    }

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    (url.to_string(), options)
}
