use crate::errors::{QualityWarning, WarningPolicy};
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReliabilityError {
    #[error("R^2 is zero, so rho = sqrt(h^2/R^2) is a division by zero (h^2 = {h2}).")]
    ZeroVarianceExplained { h2: f64 },

    #[error("{name} must be a finite number, got {value}.")]
    NonFiniteInput { name: &'static str, value: f64 },

    #[error("{0}")]
    Quality(#[from] QualityWarning),
}

/// Computes the reliability ratio `rho = sqrt(h2 / r2)`.
///
/// A negative ratio or a ratio below one is reported through `policy`. When the
/// policy lets a negative ratio through, the returned value is `NaN` and the
/// correction builder refuses it downstream.
pub fn reliability_ratio(h2: f64, r2: f64, policy: &WarningPolicy) -> Result<f64, ReliabilityError> {
    for (name, value) in [("h2", h2), ("R2", r2)] {
        if !value.is_finite() {
            return Err(ReliabilityError::NonFiniteInput { name, value });
        }
    }
    if r2 == 0.0 {
        return Err(ReliabilityError::ZeroVarianceExplained { h2 });
    }

    let ratio = h2 / r2;
    if ratio < 0.0 {
        policy.raise(QualityWarning::NegativeRatio { h2, r2 })?;
        return Ok(f64::NAN);
    }

    let rho = ratio.sqrt();
    debug!("rho is estimated to be sqrt({h2}/{r2}) = {rho}");
    if rho < 1.0 {
        policy.raise(QualityWarning::RhoBelowOne { rho, h2, r2 })?;
    }
    Ok(rho)
}
