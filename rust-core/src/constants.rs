// Locked kernel constants. Built once at startup, then only ever borrowed.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Constants {
    /// Pressure gain: entropy injected per `Pressure`.
    pub alpha: f64,
    /// Release damping: entropy removed per `Release`.
    pub beta: f64,
    /// Cycle decay: entropy multiplier applied by `Cycle`.
    pub gamma: f64,
    /// Natural decay per idle tick, used by forecasts.
    pub k: f64,
    /// Lower stability threshold (Stable / Warning).
    pub b1: f64,
    /// Upper stability threshold (Unstable / Collapsed).
    pub b2: f64,
    /// Commit gate ceiling for the normalised load `entropy / b2`.
    pub sigma_max: f64,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            alpha: 0.12,
            beta: 0.10,
            gamma: 0.50,
            k: 0.02,
            b1: 0.20,
            b2: 1.00,
            sigma_max: 0.70,
        }
    }
}

impl Constants {
    pub fn new(
        alpha: f64,
        beta: f64,
        gamma: f64,
        k: f64,
        b1: f64,
        b2: f64,
        sigma_max: f64,
    ) -> Result<Self, ConfigError> {
        let c = Self {
            alpha,
            beta,
            gamma,
            k,
            b1,
            b2,
            sigma_max,
        };
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("gamma", self.gamma),
            ("k", self.k),
            ("b1", self.b1),
            ("b2", self.b2),
            ("sigma_max", self.sigma_max),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!("{name} must be finite")));
            }
        }
        if self.alpha < 0.0 {
            return Err(ConfigError::Invalid("alpha must be >= 0".into()));
        }
        if self.beta < 0.0 {
            return Err(ConfigError::Invalid("beta must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ConfigError::Invalid("gamma must be within [0, 1]".into()));
        }
        if !(0.0..1.0).contains(&self.k) {
            return Err(ConfigError::Invalid("k must be within [0, 1)".into()));
        }
        if self.b1 <= 0.0 || self.b1 >= self.b2 {
            return Err(ConfigError::Invalid("thresholds must satisfy 0 < b1 < b2".into()));
        }
        if self.sigma_max <= 0.0 {
            return Err(ConfigError::Invalid("sigma_max must be > 0".into()));
        }
        Ok(())
    }

    /// Entropy at which Warning turns into Unstable.
    pub fn unstable_floor(&self) -> f64 {
        (self.b1 + self.b2) / 2.0
    }
}
