use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How the fetched artifact maps onto the destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetterMode {
    /// Archives and repositories fill the destination directory; a plain
    /// file lands inside it under its URL file name.
    #[default]
    Any,
    /// The destination is the file itself. Archives are not extracted.
    File,
    /// The artifact must produce a directory tree.
    Dir,
}

impl FromStr for GetterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(GetterMode::Any),
            "file" => Ok(GetterMode::File),
            "dir" => Ok(GetterMode::Dir),
            other => Err(format!("unknown getter mode '{other}' (expected any, file or dir)")),
        }
    }
}

impl fmt::Display for GetterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GetterMode::Any => "any",
            GetterMode::File => "file",
            GetterMode::Dir => "dir",
        })
    }
}

/// A single artifact to fetch for a task.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSpec {
    /// Source URL, optionally forced to a transport with a `git::`-style prefix.
    /// Supports ${ENV_VAR} interpolation.
    pub source: String,
    /// Destination relative to the task directory.
    /// Supports ${ENV_VAR} interpolation.
    pub destination: String,
    /// Skip TLS certificate validation
    pub insecure: bool,
    /// Hand the placed files to the task's runtime user
    pub chown: bool,
    pub mode: GetterMode,
    /// Extra HTTP request headers (values support interpolation)
    pub headers: BTreeMap<String, String>,
}

impl ArtifactSpec {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getter_mode_parse() {
        assert_eq!("any".parse::<GetterMode>().unwrap(), GetterMode::Any);
        assert_eq!("file".parse::<GetterMode>().unwrap(), GetterMode::File);
        assert_eq!("dir".parse::<GetterMode>().unwrap(), GetterMode::Dir);
        assert!("both".parse::<GetterMode>().is_err());
    }

    #[test]
    fn test_new_defaults() {
        let spec = ArtifactSpec::new("https://example.com/a.txt", "local");
        assert_eq!(spec.mode, GetterMode::Any);
        assert!(!spec.insecure);
        assert!(!spec.chown);
        assert!(spec.headers.is_empty());
    }
}
