//! Git and Mercurial clones through the system binaries.
//!
//! Children are spawned with `kill_on_drop`, so when the caller's deadline
//! expires and the fetch future is dropped the clone is killed too.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Fetch, FetchRequest};
use crate::error::{Result, SandboxError};

pub struct GitGetter;

pub struct HgGetter;

#[async_trait]
impl Fetch for GitGetter {
    async fn fetch(&self, req: &FetchRequest) -> Result<()> {
        let mut clone = Command::new("git");
        if req.insecure {
            clone.args(["-c", "http.sslVerify=false"]);
        }
        clone.arg("clone");
        if let Some(depth) = req.options.depth {
            clone.arg(format!("--depth={depth}"));
            if let Some(ref revision) = req.options.revision {
                clone.args(["--branch", revision.as_str()]);
            }
        }
        clone.arg("--").arg(&req.url).arg(&req.dest);
        run(req, "git", clone).await?;

        // Shallow clones already checked out the branch or tag
        if let (Some(revision), None) = (&req.options.revision, req.options.depth) {
            let mut checkout = Command::new("git");
            checkout
                .arg("-C")
                .arg(&req.dest)
                .args(["checkout", "--quiet", revision.as_str()]);
            run(req, "git", checkout).await?;
        }

        info!("Cloned git repository {} → {}", req.url, req.dest.display());
        Ok(())
    }
}

#[async_trait]
impl Fetch for HgGetter {
    async fn fetch(&self, req: &FetchRequest) -> Result<()> {
        let mut clone = Command::new("hg");
        clone.arg("clone");
        if req.insecure {
            clone.arg("--insecure");
        }
        if let Some(ref revision) = req.options.revision {
            clone.args(["--updaterev", revision.as_str()]);
        }
        clone.arg("--").arg(&req.url).arg(&req.dest);
        run(req, "hg", clone).await?;

        info!("Cloned mercurial repository {} → {}", req.url, req.dest.display());
        Ok(())
    }
}

async fn run(req: &FetchRequest, program: &str, mut command: Command) -> Result<()> {
    command
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("HGPLAIN", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running {program} for {}", req.url);

    let output = command
        .output()
        .await
        .map_err(|e| SandboxError::transport(&req.url, format!("cannot run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SandboxError::transport(
            &req.url,
            format!("{program} exited with {}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(())
}
