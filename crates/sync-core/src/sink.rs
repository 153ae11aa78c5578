//! Error sink for terminal failures
//!
//! The retry engine's callers, the sync queue, the realtime manager and the
//! session manager report terminal failures here so an external logger or
//! alerting pipeline can pick them up.

use crate::error::{ErrorCategory, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured report of a terminal failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl ErrorReport {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Build a report from an error, using its category and message
    pub fn from_error(error: &SyncError) -> Self {
        Self::new(error.category(), error.to_string())
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}

/// Receiver of terminal failure reports
pub trait ErrorSink: Send + Sync {
    fn report(&self, report: ErrorReport);
}
