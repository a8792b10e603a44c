//! Variable interpolation for toolchain commands.
//!
//! Supports variables like:
//! - `${project.name}` - Project name
//! - `${project.binary}` - Release binary name
//! - `${stage.name}` - Current stage name
//! - `${workspace}` - Workspace path as seen by the job (left as written
//!   while unset)
//! - `${env.VAR_NAME}` - Environment variable
//! - `${name}` - Custom variable

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub project: ProjectContext,
    pub stage: StageContext,
    /// Workspace path as seen by the job.
    pub workspace: String,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Custom variables defined by user
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectContext {
    pub name: String,
    pub binary: String,
}

#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_project(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            project: ProjectContext {
                name: name.into(),
                binary: binary.into(),
            },
            ..Self::default()
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["project", "name"] => Some(self.project.name.clone()),
            ["project", "binary"] => Some(self.project.binary.clone()),
            ["stage", "name"] => Some(self.stage.name.clone()),
            ["workspace"] if !self.workspace.is_empty() => Some(self.workspace.clone()),
            ["env", name] => self.env.get(*name).cloned(),
            [name] => self.custom.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left
    /// as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate variables in the values of a map.
    pub fn interpolate_map<'a>(
        &self,
        map: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> HashMap<String, String> {
        map.into_iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}
