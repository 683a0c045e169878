//! Deduplicated run diagnostics
//!
//! Reportable problems never unwind the call stack: they are recorded here,
//! once per distinct message per run, and processing continues with a safe
//! substitute value. A separate debug channel carries the demoted notes
//! produced by columns that opted into silent nulling.

use std::collections::HashSet;
use tracing::{debug, error};

/// Collected non-fatal diagnostics for one import run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<String>,
    seen: HashSet<String>,
    debug_notes: Vec<String>,
    debug_seen: HashSet<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reportable diagnostic. Repeats of the same message are
    /// dropped; the first occurrence is logged at error level.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.seen.insert(message.clone()) {
            error!("{}", message);
            self.errors.push(message);
        }
    }

    /// Record a debug-level note (non-error). Deduplicated like `error`
    /// but logged at debug level and kept out of the error list.
    pub fn debug(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.debug_seen.insert(message.clone()) {
            debug!("{}", message);
            self.debug_notes.push(message);
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn debug_notes(&self) -> &[String] {
        &self.debug_notes
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors recorded since a previously taken `error_count` watermark.
    pub fn errors_since(&self, mark: usize) -> &[String] {
        &self.errors[mark.min(self.errors.len())..]
    }
}
