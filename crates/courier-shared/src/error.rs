use thiserror::Error;

/// Failure to interpret an identifier or enum value supplied from outside.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Malformed {kind} id: {value:?}")]
    Malformed { kind: &'static str, value: String },

    #[error("Unknown {kind}: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}
