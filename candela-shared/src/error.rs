use crate::TimestampMs;

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Field '{field}' must be strictly positive, got {value}.")]
    NonPositiveField { field: &'static str, value: f64 },

    #[error("Symbol must be a non-empty string.")]
    EmptySymbol,

    #[error("Timestamp {0}ms is outside the representable range.")]
    TimestampOutOfRange(TimestampMs),

    #[error("Unsupported time unit '{0}'.")]
    UnsupportedUnit(String),

    #[error("Window size must be at least 1.")]
    ZeroWindowSize,

    #[error("Window arithmetic left the representable time range.")]
    WindowOutOfRange,
}

impl DataError {
    pub fn non_positive(field: &'static str, value: f64) -> Self {
        Self::NonPositiveField { field, value }
    }
}
