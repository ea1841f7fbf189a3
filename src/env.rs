//! Task environment capability used to interpolate artifact strings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maps task-scoped variable references to literal strings.
pub trait EnvReplacer: Send + Sync {
    /// Expands `${VAR}` / `$VAR` references. Unknown variables are kept verbatim.
    fn replace_env(&self, input: &str) -> String;

    /// Root directory of the task; every destination must stay below it.
    fn task_dir(&self) -> &Path;

    /// Looks up a single variable.
    fn get(&self, name: &str) -> Option<String>;
}

/// Environment backed by an explicit variable map.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    task_dir: PathBuf,
    vars: HashMap<String, String>,
}

impl TaskEnv {
    pub fn new(task_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_dir: task_dir.into(),
            vars: HashMap::new(),
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }
}

impl EnvReplacer for TaskEnv {
    fn replace_env(&self, input: &str) -> String {
        shellexpand::env_with_context_no_errors(input, |name| self.vars.get(name)).into_owned()
    }

    fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}
