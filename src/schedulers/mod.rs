//! # Noise schedulers
//!
//! Noise schedulers can be used to set the trade-off between
//! inference speed and quality.
//!
//! A scheduler goes through the following states: it is created
//! uninitialized, `set_timesteps` selects the inference timesteps, then each
//! `step` advances the denoising until every timestep has been consumed.
//! Calling `set_timesteps` again starts a fresh request.
use serde::{Deserialize, Serialize};
use tch::{kind, Kind, Tensor};

use crate::config::{NoiseScheduleConfig, SchedulerKind};
use crate::error::{Error, Result};

pub mod euler_ancestral_discrete;
pub mod lms_discrete;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    TimestepsSet,
    /// `n` steps have been performed out of the schedule.
    Stepping(usize),
    Done,
}

/// This trait represents a scheduler for the diffusion process.
pub trait Scheduler: Send {
    /// Selects `inference_steps` timesteps, descending, and resets the
    /// per-request state.
    fn set_timesteps(&mut self, inference_steps: usize) -> Result<&[usize]>;

    fn timesteps(&self) -> Result<&[usize]>;

    /// Standard deviation of the initial noise distribution.
    fn init_noise_sigma(&self) -> Result<f64>;

    fn scale_model_input(&self, sample: &Tensor, timestep: usize) -> Result<Tensor>;

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor>;

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor>;

    fn state(&self) -> SchedulerState;

    /// Re-seeds the random source of stochastic samplers. Deterministic
    /// samplers ignore this.
    fn reseed(&mut self, _seed: u64) {}
}

/// Builds the scheduler selected by the configuration.
pub fn build_scheduler(kind: SchedulerKind, config: &NoiseScheduleConfig) -> Result<Box<dyn Scheduler>> {
    let scheduler: Box<dyn Scheduler> = match kind {
        SchedulerKind::Lms => Box::new(lms_discrete::LMSDiscreteScheduler::new(*config)?),
        SchedulerKind::EulerAncestral => {
            Box::new(euler_ancestral_discrete::EulerAncestralDiscreteScheduler::new(*config)?)
        }
    };
    Ok(scheduler)
}

/// The arrays derived once from the training noise schedule.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    /// `sqrt((1 - alphas_cumprod) / alphas_cumprod)` for each training step.
    pub sigmas: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(config: &NoiseScheduleConfig) -> Result<Self> {
        config.validate()?;
        let n = config.train_timesteps as i64;
        let betas = match config.beta_schedule {
            BetaSchedule::ScaledLinear => Tensor::linspace(
                config.beta_start.sqrt(),
                config.beta_end.sqrt(),
                n,
                kind::DOUBLE_CPU,
            )
            .square(),
            BetaSchedule::Linear => {
                Tensor::linspace(config.beta_start, config.beta_end, n, kind::DOUBLE_CPU)
            }
        };
        let alphas: Tensor = 1. - &betas;
        let alphas_cumprod = alphas.cumprod(0, Kind::Double);
        let one_minus: Tensor = 1. - &alphas_cumprod;
        let sigmas = (one_minus / &alphas_cumprod).sqrt();
        Ok(Self {
            betas: Vec::<f64>::try_from(&betas)?,
            alphas: Vec::<f64>::try_from(&alphas)?,
            alphas_cumprod: Vec::<f64>::try_from(&alphas_cumprod)?,
            sigmas: Vec::<f64>::try_from(&sigmas)?,
        })
    }

    pub fn train_timesteps(&self) -> usize {
        self.betas.len()
    }

    /// `steps` evenly spaced training positions from the noisiest to the
    /// cleanest, before rounding.
    pub(crate) fn inference_positions(&self, steps: usize) -> Result<Vec<f64>> {
        let train = self.train_timesteps();
        if steps == 0 || steps > train {
            return Err(Error::config(format!(
                "number of inference steps must be in 1..={train}, got {steps}"
            )));
        }
        let positions =
            Tensor::linspace((train - 1) as f64, 0., steps as i64, kind::DOUBLE_CPU);
        Ok(Vec::<f64>::try_from(&positions)?)
    }

    /// The training sigmas linearly interpolated at fractional `positions`.
    pub(crate) fn sigmas_at(&self, positions: &[f64]) -> Result<Vec<f64>> {
        let xp = Tensor::arange(self.train_timesteps() as i64, kind::DOUBLE_CPU);
        let yp = Tensor::from_slice(&self.sigmas);
        let sigmas = interp(positions, &xp, &yp)?;
        Ok(Vec::<f64>::try_from(&sigmas)?)
    }
}

/// One-dimensional linear interpolation for monotonically increasing sample
/// points, mimicking np.interp() within the range of `xp`.
///
/// Based on https://github.com/pytorch/pytorch/issues/50334#issuecomment-1000917964
pub fn interp(x: &[f64], xp: &Tensor, yp: &Tensor) -> Result<Tensor> {
    // Slope and intercept of each segment.
    let m = (yp.slice(0, 1, None, 1) - yp.slice(0, 0, -1, 1))
        / (xp.slice(0, 1, None, 1) - xp.slice(0, 0, -1, 1));
    let b = yp.slice(0, 0, -1, 1) - (&m * xp.slice(0, 0, -1, 1));

    let segments = m.size1()?;
    let indices: Vec<Tensor> = x.iter().map(|&t| xp.le(t).sum(Kind::Int64) - 1).collect();
    let indices = Tensor::stack(&indices, 0).clamp(0, segments - 1);
    Ok(m.take(&indices) * Tensor::from_slice(x) + b.take(&indices))
}

/// Rounds the inference positions to integer timesteps. As consecutive
/// positions are at least one apart the result stays strictly decreasing.
pub(crate) fn round_timesteps(positions: &[f64]) -> Vec<usize> {
    positions.iter().map(|t| t.round() as usize).collect()
}

/// The per-request part of a scheduler, created by `set_timesteps`.
#[derive(Debug, Clone)]
pub(crate) struct InferenceSchedule {
    pub timesteps: Vec<usize>,
    /// One sigma per timestep, followed by a final zero.
    pub sigmas: Vec<f64>,
    pub init_noise_sigma: f64,
    pub steps_taken: usize,
}

impl InferenceSchedule {
    pub fn step_index(&self, timestep: usize) -> Result<usize> {
        self.timesteps.iter().position(|&t| t == timestep).ok_or(Error::UnknownTimestep(timestep))
    }

    pub fn state(&self) -> SchedulerState {
        match self.steps_taken {
            0 => SchedulerState::TimestepsSet,
            n if n >= self.timesteps.len() => SchedulerState::Done,
            n => SchedulerState::Stepping(n),
        }
    }
}

pub(crate) fn state_of(schedule: &Option<InferenceSchedule>) -> SchedulerState {
    schedule.as_ref().map_or(SchedulerState::Uninitialized, InferenceSchedule::state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_arrays() {
        let s = NoiseSchedule::new(&NoiseScheduleConfig::default()).unwrap();
        assert_eq!(s.train_timesteps(), 1000);
        assert!((s.betas[0] - 0.00085).abs() < 1e-12);
        assert!((s.betas[999] - 0.012).abs() < 1e-12);
        assert!((s.alphas_cumprod[0] - (1. - 0.00085)).abs() < 1e-12);
        assert!((s.alphas_cumprod[1] - s.alphas_cumprod[0] * s.alphas[1]).abs() < 1e-12);
        // The cumulative products decrease so the sigmas increase.
        assert!(s.alphas_cumprod.windows(2).all(|w| w[1] < w[0]));
        assert!(s.sigmas.windows(2).all(|w| w[1] > w[0]));
        let last = s.alphas_cumprod[999];
        assert!((s.sigmas[999] - ((1. - last) / last).sqrt()).abs() < 1e-9);
        // Reference value of the stable diffusion schedule.
        assert!((s.sigmas[999] - 14.6146).abs() < 1e-3);
    }

    #[test]
    fn interpolated_sigmas() {
        let xp = Tensor::from_slice(&[0., 1., 2., 3.]);
        let yp = Tensor::from_slice(&[0., 10., 20., 40.]);
        let v = Vec::<f64>::try_from(&interp(&[0., 1.5, 2.5, 3.], &xp, &yp).unwrap()).unwrap();
        let expected = [0., 15., 30., 40.];
        assert!(v.iter().zip(expected).all(|(a, b)| (a - b).abs() < 1e-9), "{v:?}");

        let s = NoiseSchedule::new(&NoiseScheduleConfig::default()).unwrap();
        let sigmas = s.sigmas_at(&[999., 0., 10.5]).unwrap();
        assert!((sigmas[0] - s.sigmas[999]).abs() < 1e-9);
        assert!((sigmas[1] - s.sigmas[0]).abs() < 1e-9);
        assert!((sigmas[2] - (s.sigmas[10] + s.sigmas[11]) / 2.).abs() < 1e-9);
    }

    #[test]
    fn linear_schedule() {
        let config = NoiseScheduleConfig {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            train_timesteps: 11,
            ..Default::default()
        };
        let s = NoiseSchedule::new(&config).unwrap();
        assert!((s.betas[5] - 0.01005).abs() < 1e-12);
    }

    #[test]
    fn timesteps_are_strictly_decreasing() {
        let s = NoiseSchedule::new(&NoiseScheduleConfig::default()).unwrap();
        for n in [1, 2, 3, 7, 30, 50, 333, 999, 1000] {
            let ts = round_timesteps(&s.inference_positions(n).unwrap());
            assert_eq!(ts.len(), n);
            assert_eq!(ts[0], 999);
            if n > 1 {
                assert_eq!(ts[n - 1], 0);
            }
            assert!(ts.windows(2).all(|w| w[0] > w[1]), "{n}");
            assert!(ts.iter().all(|&t| t < 1000));
        }
        assert!(s.inference_positions(0).is_err());
        assert!(s.inference_positions(1001).is_err());
    }
}
