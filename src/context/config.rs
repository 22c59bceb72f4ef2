//! Context configuration (simulation defaults and teardown policy).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Environment variable that keeps a context alive when its scope exits with
/// an error, for post-mortem inspection. Any value other than `0` enables it.
pub const DEBUG_ENV_VAR: &str = "NRNSCOPE_DEBUG";

/// True when [`DEBUG_ENV_VAR`] is set to anything other than `0`.
pub(crate) fn debug_env_enabled() -> bool {
    std::env::var(DEBUG_ENV_VAR).is_ok_and(|value| value.trim() != "0")
}

/// Parameters applied when a context is created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Integration timestep in ms.
    pub dt: f64,
    /// Temperature in °C.
    pub celsius: f64,
    /// Stop time for `run()` in ms.
    pub tstop: f64,
    /// Leave recorders alive (and readable) after `finish()`.
    pub keep_recorders: bool,
    /// Refuse to create a context while the kernel still holds live entities.
    pub preflight_check: bool,
    /// Skip teardown when a scope exits with an error or panic.
    pub keep_on_error: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            dt: 0.025,
            celsius: 25.0,
            tstop: 10.0,
            keep_recorders: true,
            preflight_check: true,
            keep_on_error: false,
        }
    }
}

impl ContextConfig {
    /// Default configuration with the debug override taken from
    /// [`DEBUG_ENV_VAR`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_debug_flag(std::env::var(DEBUG_ENV_VAR).ok().as_deref())
    }

    /// Apply a debug flag value as read from the environment.
    #[must_use]
    pub fn with_debug_flag(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.keep_on_error = value.trim() != "0";
        }
        self
    }

    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    /// Builder-style timestep override.
    #[must_use]
    pub const fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    /// Builder-style temperature override.
    #[must_use]
    pub const fn with_celsius(mut self, celsius: f64) -> Self {
        self.celsius = celsius;
        self
    }

    /// Builder-style stop time override.
    #[must_use]
    pub const fn with_tstop(mut self, tstop: f64) -> Self {
        self.tstop = tstop;
        self
    }

    /// Builder-style recorder policy.
    #[must_use]
    pub const fn with_keep_recorders(mut self, keep: bool) -> Self {
        self.keep_recorders = keep;
        self
    }

    /// Builder-style preflight policy.
    #[must_use]
    pub const fn with_preflight_check(mut self, check: bool) -> Self {
        self.preflight_check = check;
        self
    }

    /// Builder-style debug override.
    #[must_use]
    pub const fn with_keep_on_error(mut self, keep: bool) -> Self {
        self.keep_on_error = keep;
        self
    }

    /// Validate the configuration.
    ///
    /// This must be called before a context is created from it.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(ValidationError::InvalidConfig {
                reason: format!("dt must be a finite value > 0 (got {})", self.dt),
            });
        }
        if !self.celsius.is_finite() {
            return Err(ValidationError::InvalidConfig {
                reason: format!("celsius must be finite (got {})", self.celsius),
            });
        }
        if !(self.tstop.is_finite() && self.tstop >= 0.0) {
            return Err(ValidationError::InvalidConfig {
                reason: format!("tstop must be a finite value >= 0 (got {})", self.tstop),
            });
        }
        Ok(())
    }
}
