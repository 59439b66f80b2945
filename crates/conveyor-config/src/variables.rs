//! `((var))` interpolation for pipeline configurations.
//!
//! Placeholders are substituted into the raw KDL text before it is parsed,
//! so they may appear anywhere a string can. Values are escaped for use
//! inside a KDL string literal:
//!
//! ```kdl
//! resource "repo" type="git" {
//!     source {
//!         uri "((repo-uri))"
//!         branch "((branch))"
//!     }
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

// Regex for matching ((...)) placeholders
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\(\s*([a-zA-Z_][a-zA-Z0-9_.\-]*)\s*\)\)").unwrap()
});

/// Values available to `((var))` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse `name=value` pairs, as given on a command line.
    pub fn from_assignments<S: AsRef<str>>(pairs: &[S]) -> ConfigResult<Self> {
        let mut vars = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (name, value) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                field: "var".to_string(),
                message: format!("expected name=value, got '{pair}'"),
            })?;
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "var".to_string(),
                    message: format!("empty variable name in '{pair}'"),
                });
            }
            vars.set(name.trim(), value);
        }
        Ok(vars)
    }

    /// Names of every placeholder in `input`, deduplicated and sorted.
    pub fn referenced(input: &str) -> BTreeSet<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    /// Replace every placeholder. Fails listing all placeholders without a
    /// value, leaving nothing half-substituted.
    pub fn interpolate(&self, input: &str) -> ConfigResult<String> {
        let missing: Vec<String> = Self::referenced(input)
            .into_iter()
            .filter(|name| !self.values.contains_key(name))
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::UnresolvedVariable(missing));
        }

        Ok(VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                self.values
                    .get(&caps[1])
                    .map(|v| escape_kdl(v))
                    .unwrap_or_default()
            })
            .to_string())
    }
}

fn escape_kdl(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_interpolation() {
        let vars = Variables::new()
            .with("repo-uri", "https://example.com/app.git")
            .with("branch", "main");

        let result = vars
            .interpolate(r#"uri "((repo-uri))" branch "(( branch ))""#)
            .unwrap();
        assert_eq!(result, r#"uri "https://example.com/app.git" branch "main""#);
    }

    #[test]
    fn test_unresolved_variables_are_all_reported() {
        let vars = Variables::new().with("known", "x");
        let err = vars
            .interpolate("((known)) ((missing-b)) ((missing-a)) ((missing-a))")
            .unwrap_err();
        match err {
            ConfigError::UnresolvedVariable(names) => {
                assert_eq!(names, vec!["missing-a", "missing-b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_values_are_escaped() {
        let vars = Variables::new().with("key", "line1\n\"quoted\" \\");
        let result = vars.interpolate(r#"key "((key))""#).unwrap();
        assert_eq!(result, r#"key "line1\n\"quoted\" \\""#);
    }

    #[test]
    fn test_from_assignments() {
        let vars = Variables::from_assignments(&["a=1", "b=x=y"]).unwrap();
        assert_eq!(vars.get("a"), Some("1"));
        assert_eq!(vars.get("b"), Some("x=y"));
        assert!(Variables::from_assignments(&["novalue"]).is_err());
        assert!(Variables::from_assignments(&["=v"]).is_err());
    }

    #[test]
    fn test_single_parentheses_untouched() {
        let vars = Variables::new();
        let input = r#"run "sh" "-c" "echo $(date) (x)""#;
        assert_eq!(vars.interpolate(input).unwrap(), input);
    }
}
