//! Diffusion sampler selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Sampling scheduler used for the diffusion process.
///
/// The wire names match the original model's sampler identifiers
/// (`ddim`, `k_lms`, ...) and are what clients submit in the
/// `sampler` request field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sampler {
    #[serde(rename = "ddim")]
    Ddim,
    #[serde(rename = "k_dpm_2_a")]
    KDpm2Ancestral,
    #[serde(rename = "k_dpm_2")]
    KDpm2,
    #[serde(rename = "k_euler_a")]
    KEulerAncestral,
    #[serde(rename = "k_euler")]
    KEuler,
    #[serde(rename = "k_heun")]
    KHeun,
    #[serde(rename = "k_lms")]
    KLms,
    #[serde(rename = "plms")]
    Plms,
}

/// All supported samplers, in the order the UI presents them.
pub const ALL_SAMPLERS: &[Sampler] = &[
    Sampler::Ddim,
    Sampler::KDpm2Ancestral,
    Sampler::KDpm2,
    Sampler::KEulerAncestral,
    Sampler::KEuler,
    Sampler::KHeun,
    Sampler::KLms,
    Sampler::Plms,
];

impl Sampler {
    /// The wire identifier for this sampler.
    pub fn as_str(self) -> &'static str {
        match self {
            Sampler::Ddim => "ddim",
            Sampler::KDpm2Ancestral => "k_dpm_2_a",
            Sampler::KDpm2 => "k_dpm_2",
            Sampler::KEulerAncestral => "k_euler_a",
            Sampler::KEuler => "k_euler",
            Sampler::KHeun => "k_heun",
            Sampler::KLms => "k_lms",
            Sampler::Plms => "plms",
        }
    }
}

impl FromStr for Sampler {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_SAMPLERS
            .iter()
            .copied()
            .find(|sampler| sampler.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = ALL_SAMPLERS.iter().map(|s| s.as_str()).collect();
                CoreError::Validation(format!(
                    "Unknown sampler '{s}'. Must be one of: {}",
                    names.join(", ")
                ))
            })
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
