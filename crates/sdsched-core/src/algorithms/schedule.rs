//! Noise-schedule math shared by the algorithms.
//!
//! Everything here works on host `f64` scalars; tensors only see the final
//! per-step coefficients.

use super::config::{AlgorithmConfig, BetaSchedule, TimestepSpacing};
use crate::error::{Error, Result};

/// Evenly spaced values over `[start, end]`, both inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

pub fn betas(config: &AlgorithmConfig) -> Vec<f64> {
    let n = config.num_train_timesteps;
    match config.beta_schedule {
        BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
        BetaSchedule::ScaledLinear => linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
            .into_iter()
            .map(|b| b * b)
            .collect(),
        BetaSchedule::SquaredCosCapV2 => {
            let alpha_bar =
                |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..n)
                .map(|i| {
                    let t1 = i as f64 / n as f64;
                    let t2 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                })
                .collect()
        }
    }
}

pub fn alphas_cumprod(betas: &[f64]) -> Vec<f64> {
    betas
        .iter()
        .scan(1.0, |acc, beta| {
            *acc *= 1.0 - beta;
            Some(*acc)
        })
        .collect()
}

/// `sqrt((1 - a) / a)` for every training timestep.
pub fn train_sigmas(alphas_cumprod: &[f64]) -> Vec<f64> {
    alphas_cumprod
        .iter()
        .map(|a| ((1.0 - a) / a).sqrt())
        .collect()
}

fn check_step_count(config: &AlgorithmConfig, n: usize) -> Result<()> {
    if n == 0 || n > config.num_train_timesteps {
        return Err(Error::ConfigError(format!(
            "num_inference_steps must be in 1..={}, got {n}",
            config.num_train_timesteps
        )));
    }
    Ok(())
}

/// Descending inference timesteps for single-evaluation algorithms.
///
/// Linspace values are left fractional; alpha-indexed algorithms round them.
pub fn spaced_timesteps(config: &AlgorithmConfig, n: usize) -> Result<Vec<f64>> {
    check_step_count(config, n)?;
    let train = config.num_train_timesteps;

    let timesteps = match config.timestep_spacing {
        TimestepSpacing::Linspace => {
            let mut ts = linspace(0.0, (train - 1) as f64, n);
            ts.reverse();
            ts
        }
        TimestepSpacing::Leading => {
            let step_ratio = train / n;
            (0..n)
                .rev()
                .map(|i| (i * step_ratio + config.steps_offset) as f64)
                .collect()
        }
        TimestepSpacing::Trailing => {
            let step_ratio = train as f64 / n as f64;
            (0..n)
                .map(|i| (train as f64 - i as f64 * step_ratio).round_ties_even() - 1.0)
                .collect()
        }
    };

    if let Some(bad) = timesteps
        .iter()
        .find(|t| **t < 0.0 || **t > (train - 1) as f64)
    {
        return Err(Error::ConfigError(format!(
            "timestep {bad} falls outside the training range 0..{train}; check steps_offset"
        )));
    }
    Ok(timesteps)
}

/// Linear interpolation of `fp` over increasing `xp`, clamped at the ends.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    debug_assert_eq!(xp.len(), fp.len());
    let Some(last) = xp.len().checked_sub(1) else {
        return 0.0;
    };
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    let hi = xp.partition_point(|v| *v <= x).min(last);
    let lo = hi - 1;
    let w = (x - xp[lo]) / (xp[hi] - xp[lo]);
    fp[lo] + w * (fp[hi] - fp[lo])
}

/// Sigmas at the given (possibly fractional) timesteps.
pub fn sigmas_at(timesteps: &[f64], train_sigmas: &[f64]) -> Vec<f64> {
    let grid: Vec<f64> = (0..train_sigmas.len()).map(|i| i as f64).collect();
    timesteps
        .iter()
        .map(|t| interp(*t, &grid, train_sigmas))
        .collect()
}

/// Karras et al. (2022) sigma ramp between `sigma_max` and `sigma_min`.
pub fn karras_sigmas(sigma_min: f64, sigma_max: f64, n: usize) -> Vec<f64> {
    const RHO: f64 = 7.0;
    let min_inv = sigma_min.powf(1.0 / RHO);
    let max_inv = sigma_max.powf(1.0 / RHO);
    linspace(0.0, 1.0, n)
        .into_iter()
        .map(|ramp| (max_inv + ramp * (min_inv - max_inv)).powf(RHO))
        .collect()
}

/// Fractional training timestep whose sigma is `sigma`, interpolated in log space.
pub fn sigma_to_t(sigma: f64, log_sigmas: &[f64]) -> f64 {
    let log_sigma = sigma.max(1e-10).ln();
    let max_low = log_sigmas.len().saturating_sub(2);
    let low_idx = log_sigmas
        .iter()
        .rposition(|ls| log_sigma - ls >= 0.0)
        .unwrap_or(0)
        .min(max_low);
    let high_idx = low_idx + 1;
    let low = log_sigmas[low_idx];
    let high = log_sigmas[high_idx];
    let w = ((low - log_sigma) / (low - high)).clamp(0.0, 1.0);
    (1.0 - w) * low_idx as f64 + w * high_idx as f64
}

/// Position of `timestep` in a schedule, tolerating precision loss in transit.
pub fn index_for_timestep(timesteps: &[f64], timestep: f64) -> Option<usize> {
    timesteps
        .iter()
        .enumerate()
        .map(|(i, t)| (i, (t - timestep).abs()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .filter(|(_, diff)| *diff < 1.0)
        .map(|(i, _)| i)
}

/// Training-table index for an integral timestep value.
pub fn train_index(timestep: f64, num_train_timesteps: usize) -> Result<usize> {
    let rounded = timestep.round();
    if !rounded.is_finite() || rounded < 0.0 || rounded >= num_train_timesteps as f64 {
        return Err(Error::BackendError(format!(
            "timestep {timestep} is outside the training range 0..{num_train_timesteps}"
        )));
    }
    Ok(rounded as usize)
}
