//! Scheduler identifiers, capability helpers and parser utilities.

use std::fmt;
use std::str::FromStr;

use crate::algorithms::{
    Algorithm, AlgorithmConfig, DdimAlgorithm, DdpmAlgorithm, DpmSolverMultistepAlgorithm,
    EulerAlgorithm, EulerAncestralAlgorithm, LcmAlgorithm, LmsDiscreteAlgorithm,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerId {
    Ddim,
    Ddpm,
    EulerDiscrete,
    EulerAncestralDiscrete,
    DpmSolverMultistep,
    DpmSolverMultistepKarras,
    LmsDiscrete,
    Lcm,
}

/// Identifiers known to diffusers pipelines that have no implementation here.
///
/// PNDM, KDPM2 and Heun evaluate the network more than once per step, so
/// their timestep sequences are not one entry per inference step. DEIS and
/// DPM-Solver singlestep are single-evaluation but not implemented.
const UNSUPPORTED: &[&str] = &[
    "PNDM",
    "KDPM2Discrete",
    "KDPM2AncestralDiscrete",
    "DEISMultistep",
    "DPMSolverSinglestep",
    "HeunDiscrete",
];

impl SchedulerId {
    pub fn all() -> &'static [SchedulerId] {
        use SchedulerId::*;

        &[
            Ddim,
            Ddpm,
            EulerDiscrete,
            EulerAncestralDiscrete,
            DpmSolverMultistep,
            DpmSolverMultistepKarras,
            LmsDiscrete,
            Lcm,
        ]
    }

    /// Canonical identifier, also used in compiled-module artifact names.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerId::Ddim => "DDIM",
            SchedulerId::Ddpm => "DDPM",
            SchedulerId::EulerDiscrete => "EulerDiscrete",
            SchedulerId::EulerAncestralDiscrete => "EulerAncestralDiscrete",
            SchedulerId::DpmSolverMultistep => "DPMSolverMultistep",
            SchedulerId::DpmSolverMultistepKarras => "DPMSolverMultistepKarras",
            SchedulerId::LmsDiscrete => "LMSDiscrete",
            SchedulerId::Lcm => "LCMScheduler",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            SchedulerId::Ddim => &["ddim", "DDIMScheduler"],
            SchedulerId::Ddpm => &["ddpm", "DDPMScheduler"],
            SchedulerId::EulerDiscrete => &["euler", "EulerDiscreteScheduler"],
            SchedulerId::EulerAncestralDiscrete => &[
                "euler_a",
                "euler-ancestral",
                "EulerAncestral",
                "EulerAncestralDiscreteScheduler",
            ],
            SchedulerId::DpmSolverMultistep => &[
                "dpm++2m",
                "dpmpp_2m",
                "dpm-solver++",
                "DPMSolverMultistepScheduler",
            ],
            SchedulerId::DpmSolverMultistepKarras => &[
                "dpm++2m-karras",
                "dpmpp_2m_karras",
                "dpm++2m karras",
            ],
            SchedulerId::LmsDiscrete => &["lms", "k_lms", "LMSDiscreteScheduler"],
            SchedulerId::Lcm => &["lcm", "latent-consistency"],
        }
    }

    /// Whether a step draws fresh noise from the seeded generator.
    pub fn is_stochastic(&self) -> bool {
        matches!(
            self,
            SchedulerId::Ddpm | SchedulerId::EulerAncestralDiscrete | SchedulerId::Lcm
        )
    }

    pub fn solver_order(&self) -> usize {
        match self {
            SchedulerId::DpmSolverMultistep | SchedulerId::DpmSolverMultistepKarras => 2,
            SchedulerId::LmsDiscrete => 4,
            _ => 1,
        }
    }

    pub fn create(&self, config: &AlgorithmConfig) -> Result<Box<dyn Algorithm>> {
        let config = config.clone();
        let algorithm: Box<dyn Algorithm> = match self {
            SchedulerId::Ddim => Box::new(DdimAlgorithm::new(config)?),
            SchedulerId::Ddpm => Box::new(DdpmAlgorithm::new(config)?),
            SchedulerId::EulerDiscrete => Box::new(EulerAlgorithm::new(config)?),
            SchedulerId::EulerAncestralDiscrete => Box::new(EulerAncestralAlgorithm::new(config)?),
            SchedulerId::DpmSolverMultistep => Box::new(DpmSolverMultistepAlgorithm::new(
                AlgorithmConfig {
                    use_karras_sigmas: false,
                    ..config
                },
            )?),
            SchedulerId::DpmSolverMultistepKarras => Box::new(DpmSolverMultistepAlgorithm::new(
                AlgorithmConfig {
                    use_karras_sigmas: true,
                    ..config
                },
            )?),
            SchedulerId::LmsDiscrete => Box::new(LmsDiscreteAlgorithm::new(config)?),
            SchedulerId::Lcm => Box::new(LcmAlgorithm::new(config)?),
        };
        Ok(algorithm)
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_scheduler_id(s)
    }
}

pub fn parse_scheduler_id(input: &str) -> Result<SchedulerId> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::UnknownScheduler("<empty>".to_string()));
    }

    let normalized = normalize_identifier(trimmed);
    if let Some(found) = SchedulerId::all()
        .iter()
        .copied()
        .find(|id| matches_alias(*id, &normalized))
    {
        return Ok(found);
    }

    let base = strip_suffix(&normalized);
    if let Some(name) = UNSUPPORTED
        .iter()
        .find(|name| normalize_identifier(name) == base)
    {
        return Err(Error::UnknownScheduler(format!(
            "{name} is not supported (available: {})",
            available()
        )));
    }

    Err(Error::UnknownScheduler(format!(
        "{trimmed} (available: {})",
        available()
    )))
}

fn matches_alias(id: SchedulerId, normalized: &str) -> bool {
    normalize_identifier(id.as_str()) == normalized
        || id
            .aliases()
            .iter()
            .any(|alias| normalize_identifier(alias) == normalized)
}

fn strip_suffix(normalized: &str) -> &str {
    normalized.strip_suffix("scheduler").unwrap_or(normalized)
}

fn available() -> String {
    SchedulerId::all()
        .iter()
        .map(SchedulerId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lowercase and keep alphanumerics plus `+`, so `dpm++2m` stays distinct from `dpm2m`.
fn normalize_identifier(input: &str) -> String {
    input
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '+')
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}
