//! Parameter grid arithmetic for sweeps.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt;

use crate::errors::SweepError;

/// The arithmetic progression `start + n·delta` a sweep walks along.
///
/// Values are computed in decimal so that, for example, the tenth step of a
/// `0.02` sweep is exactly `0.20` rather than the drift produced by repeated
/// float addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterGrid {
    start: Decimal,
    delta: Decimal,
}

impl ParameterGrid {
    pub fn new(start: f64, delta: f64) -> Result<Self, SweepError> {
        let start = Decimal::from_f64(start).ok_or_else(|| SweepError::InvalidConfig {
            message: format!("start value {start} is not representable"),
        })?;
        let delta = Decimal::from_f64(delta).ok_or_else(|| SweepError::InvalidConfig {
            message: format!("step delta {delta} is not representable"),
        })?;
        if delta <= Decimal::ZERO {
            return Err(SweepError::InvalidConfig {
                message: format!("step delta must be positive, got {delta}"),
            });
        }
        Ok(Self { start, delta })
    }

    /// The point dispatched at sweep-local index `index`.
    pub fn point(&self, index: u64) -> ParameterPoint {
        ParameterPoint {
            index,
            value: self.start + self.delta * Decimal::from(index),
        }
    }

    pub fn start(&self) -> Decimal {
        self.start
    }

    pub fn delta(&self) -> Decimal {
        self.delta
    }
}

/// A single dispatched parameter value together with its dispatch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterPoint {
    pub index: u64,
    pub value: Decimal,
}

impl ParameterPoint {
    /// The value handed to evaluators.
    pub fn as_f64(&self) -> f64 {
        // Every grid value is well inside f64 range.
        self.value.to_f64().unwrap_or(f64::NAN)
    }
}

impl fmt::Display for ParameterPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}
