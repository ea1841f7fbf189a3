//! Fetches task artifacts into a sandboxed directory.
//!
//! An artifact is downloaded (HTTP(S), Git, Mercurial, S3 or GCS) into a
//! private staging area, scanned for symlinks that would resolve outside
//! the task directory, merged into its destination and optionally handed
//! to the task's unprivileged user. See [`Sandbox::get`].

pub mod archive;
pub mod artifact;
pub mod backoff;
pub mod config;
pub mod env;
pub mod error;
pub mod inspect;
pub mod owner;
pub mod place;
pub mod resolve;
pub mod sandbox;
pub mod staging;
pub mod transport;

pub use artifact::{ArtifactSpec, GetterMode};
pub use config::SandboxConfig;
pub use env::{EnvReplacer, TaskEnv};
pub use error::{ErrorKind, SandboxError, Stage};
pub use sandbox::Sandbox;
