//! Error taxonomy for the fetch-and-place pipeline.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Pipeline step that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Fetching,
    Inspecting,
    Placing,
    Owning,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolve",
            Stage::Fetching => "fetch",
            Stage::Inspecting => "inspect",
            Stage::Placing => "place",
            Stage::Owning => "chown",
        };
        f.write_str(name)
    }
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Escape,
    Transport,
    Limit,
    Filesystem,
    Identity,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Destination or staged content resolves outside the sandbox root.
    #[error("artifact escapes the sandbox: {}", path.display())]
    SandboxEscape { path: PathBuf },

    #[error("failed to fetch {source_url}: {message}")]
    Transport { source_url: String, message: String },

    #[error("unsupported artifact source: {0}")]
    UnsupportedSource(String),

    #[error("artifact exceeds size limit: {actual} bytes (max {limit})")]
    LimitExceeded { limit: u64, actual: u64 },

    #[error("{transport} fetch timed out after {}", humantime::format_duration(*after))]
    Timeout { transport: &'static str, after: Duration },

    #[error("failed to extract archive: {0}")]
    Archive(String),

    #[error("{}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot place {}: {reason}", path.display())]
    Collision { path: PathBuf, reason: &'static str },

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("failed to look up user {user}: {message}")]
    Identity { user: String, message: String },

    /// Wraps the first failing step's error with the step that raised it.
    #[error("artifact {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<SandboxError>,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SandboxError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn escape(path: impl Into<PathBuf>) -> Self {
        SandboxError::SandboxEscape { path: path.into() }
    }

    pub(crate) fn transport(source_url: &str, message: impl Into<String>) -> Self {
        SandboxError::Transport {
            source_url: source_url.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn at(self, stage: Stage) -> Self {
        SandboxError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Returns the error beneath any stage wrapper.
    pub fn root_cause(&self) -> &SandboxError {
        match self {
            SandboxError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the step that failed, if the error came from the façade.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SandboxError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_sandbox_escape(&self) -> bool {
        matches!(self.root_cause(), SandboxError::SandboxEscape { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root_cause() {
            SandboxError::SandboxEscape { .. } => ErrorKind::Escape,
            SandboxError::Transport { .. }
            | SandboxError::UnsupportedSource(_)
            | SandboxError::Archive(_) => ErrorKind::Transport,
            SandboxError::LimitExceeded { .. } | SandboxError::Timeout { .. } => ErrorKind::Limit,
            SandboxError::Filesystem { .. } | SandboxError::Collision { .. } => {
                ErrorKind::Filesystem
            }
            SandboxError::UnknownUser(_) | SandboxError::Identity { .. } => ErrorKind::Identity,
            // root_cause never returns a wrapper
            SandboxError::Stage { source, .. } => source.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wrapper_keeps_root_cause() {
        let err = SandboxError::escape("/etc").at(Stage::Inspecting);
        assert!(err.is_sandbox_escape());
        assert_eq!(err.stage(), Some(Stage::Inspecting));
        assert_eq!(err.kind(), ErrorKind::Escape);
        assert!(err.to_string().starts_with("artifact inspect failed"));
    }

    #[test]
    fn test_kind_classification() {
        let limit = SandboxError::LimitExceeded { limit: 1, actual: 2 };
        assert_eq!(limit.kind(), ErrorKind::Limit);

        let timeout = SandboxError::Timeout {
            transport: "git",
            after: Duration::from_secs(90),
        };
        assert_eq!(timeout.kind(), ErrorKind::Limit);
        assert!(timeout.to_string().contains("1m 30s"));

        let user = SandboxError::UnknownUser("ghost".to_string()).at(Stage::Owning);
        assert_eq!(user.kind(), ErrorKind::Identity);
        assert!(!user.is_sandbox_escape());

        let collision = SandboxError::Collision {
            path: PathBuf::from("/x"),
            reason: "is a directory",
        };
        assert_eq!(collision.kind(), ErrorKind::Filesystem);
    }

    #[test]
    fn test_unwrapped_error_has_no_stage() {
        let err = SandboxError::transport("https://example.com", "HTTP 404");
        assert_eq!(err.stage(), None);
        assert_eq!(
            err.to_string(),
            "failed to fetch https://example.com: HTTP 404"
        );
    }
}
