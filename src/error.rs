use thiserror::Error;

/// Construction-time failures.
///
/// The per-step simulation path is total: over-limit conditions degrade by
/// reducing the realized power, and runtime anomalies are reported through the
/// drainable message log instead of an error type.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter {
        field: &'static str,
        reason: String,
    },
}

impl StorageError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }
}
