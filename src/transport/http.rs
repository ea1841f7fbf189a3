/// HTTP(S) downloads with a hard body-size cap.
///
/// The body is streamed to disk and counted as it arrives, so a server that
/// lies about (or omits) Content-Length still cannot push more than
/// `max_bytes` into the staging area. On any failure the partial file is
/// removed.
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{Fetch, FetchRequest};
use crate::error::{Result, SandboxError};

/// Connect timeout, independent of the transfer deadline
const CONNECT_TIMEOUT_SECS: u64 = 10;

const MAX_REDIRECTS: usize = 10;

const USER_AGENT: &str = concat!("artifact-sandbox/", env!("CARGO_PKG_VERSION"));

pub struct HttpGetter {
    client: Client,
}

impl HttpGetter {
    /// Builds a client for one request. TLS validation is on unless the
    /// artifact is explicitly marked insecure.
    pub fn new(req: &FetchRequest) -> Result<Self> {
        Self::with_options(req.timeout, req.insecure)
            .map_err(|e| SandboxError::transport(&req.url, error_chain(&e)))
    }

    fn with_options(timeout: Duration, insecure: bool) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(insecure)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }

    async fn download(&self, req: &FetchRequest) -> Result<u64> {
        let mut request = self.client.get(&req.url);
        for (name, value) in &req.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SandboxError::transport(&req.url, error_chain(&e)))?;

        if !response.status().is_success() {
            return Err(SandboxError::transport(
                &req.url,
                format!("HTTP {}", response.status()),
            ));
        }

        // Check Content-Length before downloading
        if let Some(content_length) = response.content_length() {
            if content_length > req.max_bytes {
                return Err(SandboxError::LimitExceeded {
                    limit: req.max_bytes,
                    actual: content_length,
                });
            }
        }

        let mut file = tokio::fs::File::create(&req.dest)
            .await
            .map_err(|e| SandboxError::fs(&req.dest, e))?;

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| SandboxError::transport(&req.url, error_chain(&e)))?;
            written += chunk.len() as u64;
            if written > req.max_bytes {
                return Err(SandboxError::LimitExceeded {
                    limit: req.max_bytes,
                    actual: written,
                });
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| SandboxError::fs(&req.dest, e))?;
        }

        file.flush().await.map_err(|e| SandboxError::fs(&req.dest, e))?;
        file.sync_all()
            .await
            .map_err(|e| SandboxError::fs(&req.dest, e))?;
        Ok(written)
    }
}

#[async_trait]
impl Fetch for HttpGetter {
    async fn fetch(&self, req: &FetchRequest) -> Result<()> {
        debug!("Downloading {} (insecure: {})", req.url, req.insecure);

        match self.download(req).await {
            Ok(size) => {
                info!("Downloaded {} ({}) → {}", req.url, format_size(size), req.dest.display());
                Ok(())
            }
            Err(e) => {
                remove_partial(&req.dest).await;
                Err(e)
            }
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Could not remove partial download {}: {e}", path.display());
        }
    }
}

/// Flattens an error and its sources so TLS failures (e.g. an unknown
/// certificate authority) are visible in the message.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Formats a byte size as a human-readable string.
fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SourceOptions;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String, dest: &Path, max_bytes: u64) -> FetchRequest {
        FetchRequest {
            url,
            dest: dest.to_path_buf(),
            timeout: Duration::from_secs(10),
            max_bytes,
            insecure: false,
            headers: BTreeMap::new(),
            options: SourceOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_downloads_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/go.mod"))
            .respond_with(ResponseTemplate::new(200).set_body_string("module example.com/app"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("go.mod");
        let req = request(format!("{}/go.mod", server.uri()), &dest, 1_000);

        HttpGetter::new(&req).unwrap().fetch(&req).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "module example.com/app");
    }

    #[tokio::test]
    async fn test_sends_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .and(header("authorization", "Bearer t0k3n"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("private");
        let mut req = request(format!("{}/private", server.uri()), &dest, 1_000);
        req.headers
            .insert("Authorization".to_string(), "Bearer t0k3n".to_string());

        HttpGetter::new(&req).unwrap().fetch(&req).await.unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_body_over_cap_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big");
        let req = request(format!("{}/big", server.uri()), &dest, 1024);

        let err = HttpGetter::new(&req).unwrap().fetch(&req).await.unwrap_err();
        assert!(matches!(err, SandboxError::LimitExceeded { limit: 1024, .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_error_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing");
        let req = request(format!("{}/missing", server.uri()), &dest, 1024);

        let err = HttpGetter::new(&req).unwrap().fetch(&req).await.unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(!dest.exists());
    }

    /// Serves `body` over HTTPS with a freshly generated self-signed certificate.
    async fn serve_self_signed(body: &'static str) -> String {
        use tokio::io::AsyncReadExt;

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string(), "localhost".to_string()])
                .unwrap();
        let identity = native_tls::Identity::from_pkcs8(
            cert.pem().as_bytes(),
            key_pair.serialize_pem().as_bytes(),
        )
        .unwrap();
        let acceptor =
            tokio_native_tls::TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    // Clients that reject the certificate abort the handshake
                    let Ok(mut tls) = acceptor.accept(socket).await else {
                        return;
                    };
                    let mut buf = [0u8; 4096];
                    let mut request = Vec::new();
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match tls.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = tls.write_all(response.as_bytes()).await;
                    let _ = tls.shutdown().await;
                });
            }
        });

        format!("https://{addr}/file")
    }

    #[tokio::test]
    async fn test_self_signed_certificate_rejected_by_default() {
        let url = serve_self_signed("ok").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file");
        let req = request(url, &dest, 1_000);

        let err = HttpGetter::new(&req).unwrap().fetch(&req).await.unwrap_err();
        assert!(matches!(err, SandboxError::Transport { .. }));
        assert!(
            err.to_string().to_lowercase().contains("certificate"),
            "unexpected error: {err}"
        );
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_self_signed_certificate_accepted_when_insecure() {
        let url = serve_self_signed("ok").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file");
        let mut req = request(url, &dest, 1_000);
        req.insecure = true;

        HttpGetter::new(&req).unwrap().fetch(&req).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "ok");
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "unknown certificate authority");
        let outer = SandboxError::fs("/tmp/x", inner);
        let message = error_chain(&outer);
        assert!(message.contains("unknown certificate authority"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500B");
        assert_eq!(format_size(1536), "1KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5MB");
    }
}
