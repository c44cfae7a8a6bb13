//! Validation errors attached to record fields
//!
//! Upload validation failures are not raised as hard errors; they are
//! collected per field so the caller can render them next to the form input.

use std::collections::BTreeMap;
use std::fmt;

/// Field carrying the upload itself
pub const UPLOADED_DATA: &str = "uploaded_data";

/// Validation errors collection, keyed by field name
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationErrors {
    /// Field-specific errors: field_name -> messages
    pub errors: BTreeMap<String, Vec<String>>,
    /// Errors not tied to a specific field
    pub base_errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn add_base(&mut self, message: impl Into<String>) {
        self.base_errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.base_errors.is_empty()
    }

    /// Check if there are errors for a specific field
    pub fn has_error(&self, field: &str) -> bool {
        self.errors.contains_key(field)
    }

    /// Get errors for a specific field
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.errors.get(field).map(Vec::as_slice)
    }

    /// Drop every message recorded for `field`
    pub fn clear_field(&mut self, field: &str) {
        self.errors.remove(field);
    }

    pub fn clear(&mut self) {
        self.errors.clear();
        self.base_errors.clear();
    }

    pub fn full_messages(&self) -> Vec<String> {
        let mut messages = self.base_errors.clone();
        for (field, field_messages) in &self.errors {
            for msg in field_messages {
                messages.push(format!("{} {}", field, msg));
            }
        }
        messages
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_messages().join(", "))
    }
}

impl std::error::Error for ValidationErrors {}
