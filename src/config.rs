use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide artifact fetching settings.
///
/// Built once at startup and shared read-only (behind an `Arc`) by every
/// concurrent fetch.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Deadline for a whole HTTP transfer, e.g. "30m"
    #[serde(deserialize_with = "duration_str")]
    pub http_read_timeout: Duration,
    /// Hard cap on an HTTP response body, in bytes
    pub http_max_bytes: u64,
    #[serde(deserialize_with = "duration_str")]
    pub gcs_timeout: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub git_timeout: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub hg_timeout: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub s3_timeout: Duration,
    /// Skips artifact inspection and the canonical destination check
    pub disable_filesystem_isolation: bool,
    /// Skips artifact inspection only
    pub disable_artifact_inspection: bool,
    /// Parent directory for staging areas (defaults to the system temp dir)
    pub staging_dir: Option<PathBuf>,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// 100 GB
const DEFAULT_HTTP_MAX_BYTES: u64 = 100_000_000_000;

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            http_read_timeout: DEFAULT_TIMEOUT,
            http_max_bytes: DEFAULT_HTTP_MAX_BYTES,
            gcs_timeout: DEFAULT_TIMEOUT,
            git_timeout: DEFAULT_TIMEOUT,
            hg_timeout: DEFAULT_TIMEOUT,
            s3_timeout: DEFAULT_TIMEOUT,
            disable_filesystem_isolation: false,
            disable_artifact_inspection: false,
            staging_dir: None,
        }
    }
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl SandboxConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${ARTIFACT_STAGING_DIR}
        let expanded = shellexpand::env(content)?;
        let config: SandboxConfig = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Whether the post-fetch symlink scan runs for this configuration.
    pub fn inspection_enabled(&self) -> bool {
        !self.disable_filesystem_isolation && !self.disable_artifact_inspection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.http_read_timeout, Duration::from_secs(1800));
        assert_eq!(config.http_max_bytes, 100_000_000_000);
        assert_eq!(config.git_timeout, Duration::from_secs(1800));
        assert!(config.inspection_enabled());
        assert!(config.staging_dir.is_none());
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = SandboxConfig::parse("").unwrap();
        assert_eq!(config.s3_timeout, DEFAULT_TIMEOUT);
        assert!(!config.disable_filesystem_isolation);
    }

    #[test]
    fn test_parse_human_durations() {
        let config = SandboxConfig::parse(
            r#"
            http_read_timeout = "10s"
            http_max_bytes = 1000000
            git_timeout = "2m"
            hg_timeout = "1h"
            "#,
        )
        .unwrap();
        assert_eq!(config.http_read_timeout, Duration::from_secs(10));
        assert_eq!(config.http_max_bytes, 1_000_000);
        assert_eq!(config.git_timeout, Duration::from_secs(120));
        assert_eq!(config.hg_timeout, Duration::from_secs(3600));
        assert_eq!(config.gcs_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_parse_rejects_bad_duration() {
        assert!(SandboxConfig::parse(r#"git_timeout = "soon""#).is_err());
    }

    #[test]
    fn test_parse_expands_env_vars() {
        std::env::set_var("ARTIFACT_SANDBOX_TEST_STAGING", "/var/tmp/staging");
        let config =
            SandboxConfig::parse(r#"staging_dir = "${ARTIFACT_SANDBOX_TEST_STAGING}""#).unwrap();
        assert_eq!(config.staging_dir, Some(PathBuf::from("/var/tmp/staging")));
    }

    #[test]
    fn test_inspection_switches() {
        let mut config = SandboxConfig::default();
        config.disable_artifact_inspection = true;
        assert!(!config.inspection_enabled());

        let mut config = SandboxConfig::default();
        config.disable_filesystem_isolation = true;
        assert!(!config.inspection_enabled());
    }
}
