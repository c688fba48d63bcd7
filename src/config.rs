//! Runtime toggles for the compiled-in fixes

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{Fix, Target};
use crate::error::Result;

/// Which fixes to apply. The default applies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Names of optional fixes to skip
    pub disabled: Vec<String>,
}

impl Config {
    /// Parses a configuration from JSON, e.g. `{"disabled": ["no_nagscreens"]}`
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether the fix named `name` should be applied
    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.iter().any(|d| d == name)
    }

    /// Fixes of `target` that should be applied, in application order.
    ///
    /// Mandatory fixes are always included; only optional ones can be disabled.
    pub fn enabled_fixes(&self, target: &Target) -> Vec<&'static Fix> {
        for name in &self.disabled {
            match target.fix(name) {
                None => warn!("Ignoring unknown fix {name:?} in configuration"),
                Some(fix) if fix.required => {
                    warn!("Fix {name:?} is mandatory and cannot be disabled")
                }
                Some(_) => {}
            }
        }
        target
            .fixes
            .iter()
            .filter(|fix| fix.required || self.is_enabled(fix.name))
            .collect()
    }
}
