//! Codes: unique business identifiers reserved with the remote authority.

use serde::{Deserialize, Serialize};

/// A code reserved or used by a change-set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    /// Code specification (the naming scheme).
    pub spec: String,
    /// Scope the value is unique within.
    pub scope: String,
    /// The code value.
    pub value: String,
}

impl Code {
    /// Creates a code.
    pub fn new(spec: impl Into<String>, scope: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            scope: scope.into(),
            value: value.into(),
        }
    }
}

/// Options for a remote code update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeUpdateOptions {
    /// Ask the remote to report codes it refused.
    pub denied_codes: bool,
    /// Keep updating the remaining codes after a conflict.
    pub continue_on_conflict: bool,
}

impl CodeUpdateOptions {
    /// Options used after a push: report denials, never stop early.
    pub fn after_push() -> Self {
        Self {
            denied_codes: true,
            continue_on_conflict: true,
        }
    }
}
