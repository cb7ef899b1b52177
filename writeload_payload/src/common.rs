//! Randomization ranges shared by the payload variants.

use rand::{Rng, distr::Uniform};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A half-open `[min, max)` range of field values.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ValueRange {
    /// Inclusive lower bound
    pub min: f64,
    /// Exclusive upper bound
    pub max: f64,
}

impl ValueRange {
    /// Determine whether this range can be sampled from.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if either bound is not finite, if
    /// `min >= max` or if the width `max - min` overflows.
    pub fn valid(&self) -> Result<(), Error> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(Error::Validation(format!(
                "value range bounds must be finite, got [{min}, {max})",
                min = self.min,
                max = self.max
            )));
        }
        // `sample` applies the same checks and panics where this returns an
        // error.
        Uniform::<f64>::new(self.min, self.max).map_err(|err| {
            Error::Validation(format!(
                "value range [{min}, {max}) cannot be sampled: {err}",
                min = self.min,
                max = self.max
            ))
        })?;
        Ok(())
    }

    /// Draw a value uniformly from this range. The range must be valid.
    pub fn sample<R>(&self, rng: &mut R) -> f64
    where
        R: Rng + ?Sized,
    {
        rng.random_range(self.min..self.max)
    }
}

/// An inclusive `[min, max]` range of tag identifiers.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IdRange {
    /// Inclusive lower bound
    pub min: u32,
    /// Inclusive upper bound
    pub max: u32,
}

impl IdRange {
    /// Determine whether this range can be sampled from.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `min > max`.
    pub fn valid(&self) -> Result<(), Error> {
        if self.min > self.max {
            return Err(Error::Validation(format!(
                "identifier range is empty: [{min}, {max}]",
                min = self.min,
                max = self.max
            )));
        }
        Ok(())
    }

    /// Draw an identifier uniformly from this range. The range must be valid.
    pub fn sample<R>(&self, rng: &mut R) -> u32
    where
        R: Rng + ?Sized,
    {
        rng.random_range(self.min..=self.max)
    }
}
