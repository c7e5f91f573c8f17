//! Crate-level error type.
//!
//! Only two statistical failure kinds surface to callers:
//! [`EngineError::InvalidConfiguration`] and [`EngineError::InsufficientData`].
//! Degenerate statistical inputs (constant covariates, zero pooled variance,
//! empty totals) never produce an error; they are encoded as a `degenerate`
//! flag on the returned result instead.

/// Errors produced by the inference engine and its configuration/IO surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A parameter is outside its legal domain (alpha ∉ (0,1), variant_count < 1, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Not enough valid observations remain after dropping missing values.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to parse unit table: {0}")]
    TableParse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration(msg.into())
    }

    pub(crate) fn insufficient(msg: impl Into<String>) -> Self {
        EngineError::InsufficientData(msg.into())
    }

    /// `true` for [`EngineError::InvalidConfiguration`].
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, EngineError::InvalidConfiguration(_))
    }

    /// `true` for [`EngineError::InsufficientData`].
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, EngineError::InsufficientData(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Reject probabilities outside the open unit interval (alpha, power, thresholds).
pub(crate) fn ensure_open_unit(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(EngineError::config(format!("{name} must be in (0, 1), got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_configuration() {
        let e = EngineError::config("alpha must be in (0, 1), got 2");
        assert_eq!(e.to_string(), "invalid configuration: alpha must be in (0, 1), got 2");
        assert!(e.is_invalid_configuration());
        assert!(!e.is_insufficient_data());
    }

    #[test]
    fn test_display_insufficient_data() {
        let e = EngineError::insufficient("control arm is empty");
        assert!(e.to_string().contains("control arm is empty"));
        assert!(e.is_insufficient_data());
    }

    #[test]
    fn test_ensure_open_unit_accepts_interior() {
        assert!(ensure_open_unit("alpha", 0.05).is_ok());
    }

    #[test]
    fn test_ensure_open_unit_rejects_bounds_and_nan() {
        assert!(ensure_open_unit("alpha", 0.0).is_err());
        assert!(ensure_open_unit("alpha", 1.0).is_err());
        assert!(ensure_open_unit("alpha", f64::NAN).is_err());
        assert!(ensure_open_unit("alpha", -0.3).is_err());
    }
}
