//! Tunable numeric thresholds and construction options.

use crate::error::{CcdError, Result};

/// Configuration for building and querying a [`crate::Ccd`].
///
/// # Example
/// ```
/// # use rust_tree_ccd::CcdConfig;
/// let config = CcdConfig::default().with_burnin(0.1).with_store_base_trees(true);
/// assert_eq!(config.burnin, 0.1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct CcdConfig {
    /// Probabilities in `(1, 1 + rounding_epsilon]` are clamped to 1.
    pub rounding_epsilon: f64,
    /// Probabilities above `1 + probability_error` are reported as errors.
    pub probability_error: f64,
    /// Minimum clade count at which the completion pass runs on the rayon pool.
    pub parallel_expansion_threshold: usize,
    /// Keep a copy of every folded tree (needed for common-ancestor heights).
    pub store_base_trees: bool,
    /// Fraction of leading trees dropped by [`crate::Ccd::from_trees`].
    pub burnin: f64,
    /// Trees drawn by [`crate::Ccd::probability_thresholds`].
    pub credible_samples: usize,
    /// Number of probability thresholds kept, i.e. the resolution of sampled
    /// credible levels.
    pub credible_precision: usize,
}

impl Default for CcdConfig {
    fn default() -> Self {
        CcdConfig {
            rounding_epsilon: 1e-10,
            probability_error: 1e-5,
            parallel_expansion_threshold: 20_000,
            store_base_trees: false,
            burnin: 0.0,
            credible_samples: 100_000,
            credible_precision: 100,
        }
    }
}

impl CcdConfig {
    pub fn with_rounding_epsilon(mut self, epsilon: f64) -> Self {
        self.rounding_epsilon = epsilon;
        self
    }

    pub fn with_probability_error(mut self, error: f64) -> Self {
        self.probability_error = error;
        self
    }

    pub fn with_parallel_expansion_threshold(mut self, threshold: usize) -> Self {
        self.parallel_expansion_threshold = threshold;
        self
    }

    pub fn with_store_base_trees(mut self, store: bool) -> Self {
        self.store_base_trees = store;
        self
    }

    pub fn with_burnin(mut self, burnin: f64) -> Self {
        self.burnin = burnin;
        self
    }

    pub fn with_credible_samples(mut self, samples: usize) -> Self {
        self.credible_samples = samples;
        self
    }

    pub fn with_credible_precision(mut self, precision: usize) -> Self {
        self.credible_precision = precision;
        self
    }

    /// Checks that every threshold is in range.
    pub fn validate(&self) -> Result<()> {
        if !(self.rounding_epsilon >= 0.0) {
            return Err(CcdError::InvalidConfig(format!(
                "rounding_epsilon must be non-negative, got {}",
                self.rounding_epsilon
            )));
        }
        if !(self.probability_error >= self.rounding_epsilon) {
            return Err(CcdError::InvalidConfig(format!(
                "probability_error ({}) must be at least rounding_epsilon ({})",
                self.probability_error, self.rounding_epsilon
            )));
        }
        if !(0.0..1.0).contains(&self.burnin) {
            return Err(CcdError::InvalidConfig(format!(
                "burnin must be in [0, 1), got {}",
                self.burnin
            )));
        }
        if self.credible_samples == 0 || self.credible_precision == 0 {
            return Err(CcdError::InvalidConfig(format!(
                "credible_samples ({}) and credible_precision ({}) must be positive",
                self.credible_samples, self.credible_precision
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CcdConfig::default();
        assert_eq!(config.rounding_epsilon, 1e-10);
        assert_eq!(config.probability_error, 1e-5);
        assert_eq!(config.parallel_expansion_threshold, 20_000);
        assert_eq!((config.credible_samples, config.credible_precision), (100_000, 100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(CcdConfig::default().with_burnin(1.0).validate().is_err());
        assert!(CcdConfig::default().with_burnin(-0.1).validate().is_err());
        assert!(CcdConfig::default().with_rounding_epsilon(-1.0).validate().is_err());
        assert!(
            CcdConfig::default()
                .with_probability_error(1e-12)
                .validate()
                .is_err()
        );
        assert!(CcdConfig::default().with_burnin(f64::NAN).validate().is_err());
        assert!(CcdConfig::default().with_credible_samples(0).validate().is_err());
        assert!(CcdConfig::default().with_credible_precision(0).validate().is_err());
    }
}
