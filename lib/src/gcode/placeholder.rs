//! Custom G-code template substitution.
//!
//! Templates reference variables as `{name}` or `[name]`. Unknown variables
//! and unsupported expressions are replaced by an empty string and reported
//! as [`TemplateWarning`]s; a `{` without its closing brace makes the whole
//! template unusable and is a hard [`Error::Template`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A recoverable substitution failure, reported after a successful export.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateWarning {
    /// Template the failure occurred in, e.g. `machine_start_gcode`.
    pub name: String,
    pub message: String,
}

impl fmt::Display for TemplateWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlaceholderParser {
    variables: BTreeMap<String, String>,
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

impl PlaceholderParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or overwrite a variable.
    pub fn set(&mut self, name: &str, value: impl fmt::Display) {
        self.variables.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Substitute every placeholder of `template`.
    ///
    /// Returns the processed text and the warnings raised while producing it.
    pub fn process(&self, template: &str, name: &str) -> Result<(String, Vec<TemplateWarning>)> {
        let mut out = String::with_capacity(template.len());
        let mut warnings = Vec::new();
        let mut rest = template;

        while let Some(pos) = rest.find(['{', '[']) {
            out.push_str(&rest[..pos]);
            let open = rest.as_bytes()[pos] as char;
            let close = if open == '{' { '}' } else { ']' };
            let after = &rest[pos + 1..];

            let Some(end) = after.find(close) else {
                if open == '{' {
                    return Err(Error::Template {
                        name: name.to_string(),
                        message: format!("unterminated '{{' at byte {}", template.len() - rest.len() + pos),
                    });
                }
                // A lone '[' is ordinary text.
                out.push(open);
                rest = after;
                continue;
            };

            let key = after[..end].trim();
            if open == '[' && !is_identifier(key) {
                out.push(open);
                rest = after;
                continue;
            }

            if !is_identifier(key) {
                warnings.push(TemplateWarning {
                    name: name.to_string(),
                    message: format!("unsupported expression '{}'", key),
                });
            } else if let Some(value) = self.variables.get(key) {
                out.push_str(value);
            } else {
                warnings.push(TemplateWarning {
                    name: name.to_string(),
                    message: format!("unknown variable '{}'", key),
                });
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        Ok((out, warnings))
    }
}
