//! Configuration types for a sampling run.

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Numeric precision of every tensor that leaves the scheduling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Precision {
    #[default]
    #[serde(rename = "fp16", alias = "f16", alias = "half", alias = "float16")]
    Half,
    #[serde(rename = "fp32", alias = "f32", alias = "full", alias = "float32")]
    Full,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Half => DType::F16,
            Precision::Full => DType::F32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Half => "fp16",
            Precision::Full => "fp32",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp16" | "f16" | "half" | "float16" => Ok(Precision::Half),
            "fp32" | "f32" | "full" | "float32" => Ok(Precision::Full),
            other => Err(Error::ConfigError(format!("Unsupported precision: {other}"))),
        }
    }
}

/// Immutable run parameters, fixed at engine construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Output image height in pixels
    #[serde(default = "default_image_size")]
    pub height: usize,

    /// Output image width in pixels
    #[serde(default = "default_image_size")]
    pub width: usize,

    /// Number of latents sampled together
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub precision: Precision,

    /// Total number of denoising steps
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,

    /// Mix unconditional and conditional predictions
    #[serde(default = "default_cfg")]
    pub do_classifier_free_guidance: bool,

    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,

    /// Channels of the latent space (4 for SD/SDXL VAEs)
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
}

/// Pixel-to-latent downsampling factor of the VAE.
pub const LATENT_SCALE_FACTOR: usize = 8;

fn default_image_size() -> usize {
    1024
}
fn default_batch_size() -> usize {
    1
}
fn default_num_inference_steps() -> usize {
    30
}
fn default_cfg() -> bool {
    true
}
fn default_guidance_scale() -> f64 {
    7.5
}
fn default_latent_channels() -> usize {
    4
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            height: default_image_size(),
            width: default_image_size(),
            batch_size: default_batch_size(),
            precision: Precision::default(),
            num_inference_steps: default_num_inference_steps(),
            do_classifier_free_guidance: default_cfg(),
            guidance_scale: default_guidance_scale(),
            latent_channels: default_latent_channels(),
        }
    }
}

impl SamplingConfig {
    pub fn new(height: usize, width: usize, batch_size: usize, num_inference_steps: usize) -> Self {
        Self {
            height,
            width,
            batch_size,
            num_inference_steps,
            ..Default::default()
        }
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_guidance(mut self, enabled: bool, scale: f64) -> Self {
        self.do_classifier_free_guidance = enabled;
        self.guidance_scale = scale;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % LATENT_SCALE_FACTOR != 0 {
                return Err(Error::ConfigError(format!(
                    "{name} must be a positive multiple of {LATENT_SCALE_FACTOR}, got {value}"
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(Error::ConfigError("batch_size must be at least 1".into()));
        }
        if self.num_inference_steps == 0 {
            return Err(Error::ConfigError(
                "num_inference_steps must be at least 1".into(),
            ));
        }
        if self.latent_channels == 0 {
            return Err(Error::ConfigError("latent_channels must be at least 1".into()));
        }
        if !self.guidance_scale.is_finite() {
            return Err(Error::ConfigError(format!(
                "guidance_scale must be finite, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    /// `(batch, channels, height / 8, width / 8)`
    pub fn latent_shape(&self) -> (usize, usize, usize, usize) {
        (
            self.batch_size,
            self.latent_channels,
            self.height / LATENT_SCALE_FACTOR,
            self.width / LATENT_SCALE_FACTOR,
        )
    }

    /// Batch dimension of the network input and of its noise prediction.
    pub fn model_batch(&self) -> usize {
        if self.do_classifier_free_guidance {
            self.batch_size * 2
        } else {
            self.batch_size
        }
    }
}

/// Process-level knobs read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Preferred device (`cpu`, `cuda`, `metal`); `None` auto-detects
    pub device: Option<String>,
    /// Allow compiled-module backends when an artifact is available
    pub compiled_modules_enabled: bool,
    /// Target label baked into module artifact names
    pub target: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: None,
            compiled_modules_enabled: true,
            target: default_target(),
        }
    }
}

fn default_target() -> String {
    "host".to_string()
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let device = std::env::var("SDSCHED_DEVICE")
            .ok()
            .map(|raw| raw.trim().to_ascii_lowercase())
            .filter(|raw| !raw.is_empty());

        let disabled = std::env::var("SDSCHED_DISABLE_COMPILED")
            .ok()
            .map(|raw| is_truthy(&raw))
            .unwrap_or(false);

        let target = std::env::var("SDSCHED_TARGET")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(default_target);

        Self {
            device,
            compiled_modules_enabled: !disabled,
            target,
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}
