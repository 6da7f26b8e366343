//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while constructing or decoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A reversed position lies beyond the parent position.
    #[error("reversed index {reversed} is past parent index {parent}")]
    ReversedPastParent {
        /// Parent change-set index.
        parent: u64,
        /// Reversed change-set index.
        reversed: u64,
    },

    /// A value could not be converted to the requested property type.
    #[error("cannot convert {value} to {target}")]
    Conversion {
        /// The offending value, rendered as JSON.
        value: String,
        /// Name of the target type.
        target: String,
    },
}
