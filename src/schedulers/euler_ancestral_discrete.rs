//! # Euler ancestral discrete scheduler
//!
//! The sigmas are interpolated at the fractional positions of an evenly
//! spaced schedule while the denoising model is called with the rounded
//! integer timesteps. The denoising model only accepts integer timesteps.
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::Tensor;

use super::{
    round_timesteps, state_of, InferenceSchedule, NoiseSchedule, PredictionType, Scheduler,
    SchedulerState,
};
use crate::config::NoiseScheduleConfig;
use crate::error::{Error, Result};
use crate::tensor_ops::sample_gaussian;

/// Ancestral sampling with Euler method steps.
/// Based on the original k-diffusion implementation by Katherine Crowson:
///
/// https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
pub struct EulerAncestralDiscreteScheduler {
    schedule: NoiseSchedule,
    inference: Option<InferenceSchedule>,
    rng: StdRng,
    pub config: NoiseScheduleConfig,
}

impl EulerAncestralDiscreteScheduler {
    pub fn new(config: NoiseScheduleConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(&config)?;
        Ok(Self { schedule, inference: None, rng: StdRng::from_entropy(), config })
    }

    pub fn noise_schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn sigma_at(&self, timestep: usize) -> Result<(usize, f64, f64)> {
        let inference = self.inference.as_ref().ok_or(Error::TimestepsNotSet)?;
        let step_index = inference.step_index(timestep)?;
        Ok((step_index, inference.sigmas[step_index], inference.sigmas[step_index + 1]))
    }
}

impl Scheduler for EulerAncestralDiscreteScheduler {
    fn set_timesteps(&mut self, inference_steps: usize) -> Result<&[usize]> {
        let positions = self.schedule.inference_positions(inference_steps)?;
        let mut sigmas = self.schedule.sigmas_at(&positions)?;
        sigmas.push(0.);
        let init_noise_sigma = sigmas.iter().copied().fold(0., f64::max);
        let inference = self.inference.insert(InferenceSchedule {
            timesteps: round_timesteps(&positions),
            sigmas,
            init_noise_sigma,
            steps_taken: 0,
        });
        Ok(inference.timesteps.as_slice())
    }

    fn timesteps(&self) -> Result<&[usize]> {
        let inference = self.inference.as_ref().ok_or(Error::TimestepsNotSet)?;
        Ok(inference.timesteps.as_slice())
    }

    fn init_noise_sigma(&self) -> Result<f64> {
        let inference = self.inference.as_ref().ok_or(Error::TimestepsNotSet)?;
        Ok(inference.init_noise_sigma)
    }

    fn scale_model_input(&self, sample: &Tensor, timestep: usize) -> Result<Tensor> {
        let (_, sigma, _) = self.sigma_at(timestep)?;
        // https://github.com/huggingface/diffusers/blob/aba2a65d6ab47c0d1c12fa47e9b238c1d3e34512/src/diffusers/schedulers/scheduling_euler_ancestral_discrete.py#L132
        Ok(sample / (sigma.powi(2) + 1.).sqrt())
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let (_, sigma_from, sigma_to) = self.sigma_at(timestep)?;
        let dims = sample.size();
        if model_output.size() != dims {
            return Err(Error::shape("model output", &dims, &model_output.size()));
        }
        let sigma = sigma_from;

        // 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
        let pred_original_sample = match self.config.prediction_type {
            PredictionType::Epsilon => sample - sigma * model_output,
            other => {
                return Err(Error::UnsupportedOperation(format!(
                    "euler ancestral sampling only supports epsilon prediction, got {other:?}"
                )))
            }
        };

        let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2))
            / sigma_from.powi(2))
        .sqrt();
        let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).sqrt();

        // 2. Convert to an ODE derivative
        let derivative = (sample - pred_original_sample) / sigma;
        let dt = sigma_down - sigma;

        let prev_sample = sample + derivative * dt;
        let noise = sample_gaussian(&mut self.rng, &dims, 1.)?.to_device(sample.device());

        if let Some(inference) = self.inference.as_mut() {
            inference.steps_taken += 1;
        }
        Ok(prev_sample + noise * sigma_up)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let (_, sigma, _) = self.sigma_at(timestep)?;
        Ok(original + noise * sigma)
    }

    fn state(&self) -> SchedulerState {
        state_of(&self.inference)
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }
}
