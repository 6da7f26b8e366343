//! Typed request/response exchanged with the native change-set applier.

use crate::changeset::ChangeSetToken;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction in which a batch of change-sets is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyOption {
    /// Apply new change-sets past the parent.
    Merge,
    /// Undo already-applied change-sets, keeping them for reinstatement.
    Reverse,
    /// Redo previously reversed change-sets.
    Reinstate,
}

impl fmt::Display for ApplyOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplyOption::Merge => "merge",
            ApplyOption::Reverse => "reverse",
            ApplyOption::Reinstate => "reinstate",
        };
        f.write_str(name)
    }
}

/// Status code returned by the native applier. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplyStatus(pub i32);

impl ApplyStatus {
    /// Successful apply.
    pub const SUCCESS: ApplyStatus = ApplyStatus(0);

    /// Returns true for success.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// A batch apply request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Tokens in the order they must be applied.
    pub tokens: Vec<ChangeSetToken>,
    /// Direction of the apply.
    pub option: ApplyOption,
}

impl ApplyRequest {
    /// Creates a request.
    pub fn new(tokens: Vec<ChangeSetToken>, option: ApplyOption) -> Self {
        Self { tokens, option }
    }
}

/// Outcome of a batch apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResponse {
    /// Final status; the first failure stops the batch.
    pub status: ApplyStatus,
    /// Number of tokens applied before stopping.
    pub applied: usize,
    /// Native diagnostic, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApplyResponse {
    /// A successful response covering `applied` tokens.
    pub fn success(applied: usize) -> Self {
        Self {
            status: ApplyStatus::SUCCESS,
            applied,
            message: None,
        }
    }

    /// A failed response.
    pub fn failure(status: ApplyStatus, applied: usize, message: impl Into<String>) -> Self {
        Self {
            status,
            applied,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeSetType;
    use std::path::PathBuf;

    #[test]
    fn request_json_preserves_token_fields() {
        let request = ApplyRequest::new(
            vec![ChangeSetToken {
                id: "c1".into(),
                parent_id: String::new(),
                index: 1,
                pathname: PathBuf::from("/tmp/c1.cs"),
                change_type: ChangeSetType::Regular,
                push_date: Some("2026-01-02T03:04:05Z".into()),
            }],
            ApplyOption::Reinstate,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["option"], "reinstate");
        assert_eq!(json["tokens"][0]["pushDate"], "2026-01-02T03:04:05Z");
        assert_eq!(serde_json::from_value::<ApplyRequest>(json).unwrap(), request);
    }

    #[test]
    fn status_success() {
        assert!(ApplyStatus::SUCCESS.is_success());
        assert!(!ApplyStatus(90_113).is_success());
        assert!(!ApplyResponse::failure(ApplyStatus(3), 1, "bad").status.is_success());
    }
}
