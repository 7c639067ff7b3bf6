//! Declared-metadata validation
//!
//! A [`MetadataSchema`] is an ordered list of field rules. Validation stops at
//! the first rule that fails and reports only that one.

use crate::{Metadata, Result, TuskError};
use serde::{Deserialize, Serialize};

/// A single check against one metadata field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    /// Field must be present and not blank
    Required { field: String },
    /// Character count must lie in `min..=max`
    Length { field: String, min: usize, max: usize },
    /// Value must be one of the listed options
    OneOf { field: String, allowed: Vec<String> },
    /// Value must parse as an integer in `min..=max`
    IntRange { field: String, min: i64, max: i64 },
    /// File name extension must be one of the listed options (case-insensitive)
    Extension { field: String, allowed: Vec<String> },
}

impl FieldRule {
    pub fn field(&self) -> &str {
        match self {
            FieldRule::Required { field }
            | FieldRule::Length { field, .. }
            | FieldRule::OneOf { field, .. }
            | FieldRule::IntRange { field, .. }
            | FieldRule::Extension { field, .. } => field,
        }
    }

    /// Check the rule. Only `Required` fails on an absent field.
    pub fn check(&self, metadata: &Metadata) -> Result<()> {
        let value = metadata.get(self.field()).map(|v| v.trim());

        match (self, value) {
            (FieldRule::Required { field }, None) => Err(invalid(format!("{} is required", field))),
            (FieldRule::Required { field }, Some("")) => {
                Err(invalid(format!("{} must not be empty", field)))
            }
            (FieldRule::Required { .. }, Some(_)) => Ok(()),
            (_, None) => Ok(()),
            (FieldRule::Length { field, min, max }, Some(v)) => {
                let len = v.chars().count();
                if len < *min || len > *max {
                    return Err(invalid(format!(
                        "{} must be between {} and {} characters, got {}",
                        field, min, max, len
                    )));
                }
                Ok(())
            }
            (FieldRule::OneOf { field, allowed }, Some(v)) => {
                if !allowed.iter().any(|a| a == v) {
                    return Err(invalid(format!(
                        "{} must be one of [{}], got '{}'",
                        field,
                        allowed.join(", "),
                        v
                    )));
                }
                Ok(())
            }
            (FieldRule::IntRange { field, min, max }, Some(v)) => {
                let n: i64 = v
                    .parse()
                    .map_err(|_| invalid(format!("{} must be an integer, got '{}'", field, v)))?;
                if n < *min || n > *max {
                    return Err(invalid(format!(
                        "{} must be between {} and {}, got {}",
                        field, min, max, n
                    )));
                }
                Ok(())
            }
            (FieldRule::Extension { field, allowed }, Some(v)) => {
                let ext = v
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_ascii_lowercase())
                    .unwrap_or_default();
                if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
                    return Err(invalid(format!(
                        "{} has unsupported file type '{}', allowed: [{}]",
                        field,
                        ext,
                        allowed.join(", ")
                    )));
                }
                Ok(())
            }
        }
    }
}

fn invalid(message: String) -> TuskError {
    TuskError::Validation(message)
}

/// Ordered set of metadata rules for one upload class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSchema {
    rules: Vec<FieldRule>,
}

impl MetadataSchema {
    pub fn new() -> Self {
        MetadataSchema { rules: Vec::new() }
    }

    /// Accepts any metadata
    pub fn permissive() -> Self {
        Self::new()
    }

    /// Final-project / thesis uploads
    pub fn project() -> Self {
        Self::new()
            .require("filename")
            .extension("filename", &["pdf", "doc", "docx", "zip"])
            .require("title")
            .length("title", 3, 255)
            .require("category")
            .one_of(
                "category",
                &["final_project", "thesis", "internship", "research", "community_service"],
            )
            .require("semester")
            .int_range("semester", 1, 8)
            .length("description", 0, 2000)
    }

    /// Course module uploads
    pub fn module() -> Self {
        Self::new()
            .require("filename")
            .extension("filename", &["pdf", "ppt", "pptx", "doc", "docx", "zip"])
            .require("title")
            .length("title", 3, 255)
            .require("course_code")
            .length("course_code", 2, 20)
            .require("semester")
            .int_range("semester", 1, 8)
    }

    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn require(self, field: &str) -> Self {
        self.rule(FieldRule::Required { field: field.to_string() })
    }

    pub fn length(self, field: &str, min: usize, max: usize) -> Self {
        self.rule(FieldRule::Length { field: field.to_string(), min, max })
    }

    pub fn one_of(self, field: &str, allowed: &[&str]) -> Self {
        self.rule(FieldRule::OneOf {
            field: field.to_string(),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn int_range(self, field: &str, min: i64, max: i64) -> Self {
        self.rule(FieldRule::IntRange { field: field.to_string(), min, max })
    }

    pub fn extension(self, field: &str, allowed: &[&str]) -> Self {
        self.rule(FieldRule::Extension {
            field: field.to_string(),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Validate metadata, returning the first failing rule's error
    pub fn validate(&self, metadata: &Metadata) -> Result<()> {
        for rule in &self.rules {
            rule.check(metadata)?;
        }
        Ok(())
    }
}
