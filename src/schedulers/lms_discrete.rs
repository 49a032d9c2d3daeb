//! # Linear multistep discrete scheduler
//!
//! Combines the most recent model outputs with Adams–Bashforth weights and
//! transfers the sample from one timestep to the next in the
//! variance-preserving space, in the spirit of the pseudo linear multistep
//! method of Liu et al.
//!
//! Pseudo Numerical Methods for Diffusion Models on Manifolds, L. Liu et al, 2022.
//! https://arxiv.org/abs/2202.09778
use std::collections::VecDeque;

use tch::Tensor;

use super::{state_of, InferenceSchedule, NoiseSchedule, Scheduler, SchedulerState};
use crate::config::NoiseScheduleConfig;
use crate::error::{Error, Result};

/// A fixed-capacity queue of model outputs, evicting the oldest entry when full.
#[derive(Debug)]
pub(crate) struct History {
    entries: VecDeque<Tensor>,
    capacity: usize,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    /// Pushes `value`, then keeps at most `keep` (bounded by the capacity) of
    /// the most recent entries.
    fn push(&mut self, value: Tensor, keep: usize) {
        self.entries.push_back(value);
        let keep = keep.min(self.capacity);
        while self.entries.len() > keep {
            self.entries.pop_front();
        }
    }

    fn clear(&mut self) {
        self.entries.clear()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries from the most recent to the oldest.
    fn newest_first(&self) -> impl Iterator<Item = &Tensor> {
        self.entries.iter().rev()
    }
}

/// Adams–Bashforth weights for a history of `k` equally spaced values, the
/// first weight applying to the most recent one.
///
/// Each weight integrates over one step the Lagrange basis polynomial of the
/// corresponding history slot.
pub(crate) fn adams_bashforth_coefficients(k: usize) -> Vec<f64> {
    (0..k)
        .map(|j| {
            // Coefficients of prod_{i != j} (u + i), lowest degree first.
            let mut poly = vec![1.0];
            let mut denom = 1.0;
            for i in (0..k).filter(|&i| i != j) {
                let mut next = vec![0.0; poly.len() + 1];
                for (d, c) in poly.iter().enumerate() {
                    next[d] += c * i as f64;
                    next[d + 1] += c;
                }
                poly = next;
                denom *= i as f64 - j as f64;
            }
            let integral: f64 = poly.iter().enumerate().map(|(d, c)| c / (d + 1) as f64).sum();
            integral / denom
        })
        .collect()
}

pub struct LMSDiscreteScheduler {
    schedule: NoiseSchedule,
    // coefficients[k - 1] holds the weights used with k outputs in the history.
    coefficients: Vec<Vec<f64>>,
    history: History,
    inference: Option<InferenceSchedule>,
    pub config: NoiseScheduleConfig,
}

impl LMSDiscreteScheduler {
    pub fn new(config: NoiseScheduleConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(&config)?;
        let coefficients = (1..=config.order).map(adams_bashforth_coefficients).collect();
        Ok(Self {
            schedule,
            coefficients,
            history: History::new(config.order),
            inference: None,
            config,
        })
    }

    pub fn noise_schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Number of model outputs currently kept for the multistep combination.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    // The alpha product after `step_index`, the final step reaching a clean sample.
    fn alpha_prod_prev(&self, inference: &InferenceSchedule, step_index: usize) -> f64 {
        match inference.timesteps.get(step_index + 1) {
            Some(&prev) => self.schedule.alphas_cumprod[prev],
            None => 1.0,
        }
    }

    /// Performs a multistep update combining up to `order` model outputs.
    pub fn step_with_order(
        &mut self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        order: usize,
    ) -> Result<Tensor> {
        let inference = self.inference.as_ref().ok_or(Error::TimestepsNotSet)?;
        if order == 0 {
            return Err(Error::config("solver order must be at least 1"));
        }
        if order > self.config.order {
            return Err(Error::OrderTooHigh { requested: order, max: self.config.order });
        }
        let step_index = inference.step_index(timestep)?;
        if model_output.size() != sample.size() {
            return Err(Error::shape("model output", &sample.size(), &model_output.size()));
        }

        let alpha_prod_t = self.schedule.alphas_cumprod[timestep];
        let alpha_prod_t_prev = self.alpha_prod_prev(inference, step_index);
        let sigma = self.schedule.sigmas[timestep];
        let sigma_prev = ((1. - alpha_prod_t_prev) / alpha_prod_t_prev).sqrt();

        let current_sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        // The sigma interval, at the signal scale of the previous timestep.
        let dt = alpha_prod_t_prev.sqrt() * (sigma_prev - sigma).abs();

        self.history.push(model_output.shallow_clone(), order);
        let coeffs = &self.coefficients[self.history.len() - 1];
        let weighted_noise: Tensor = coeffs
            .iter()
            .zip(self.history.newest_first())
            .map(|(coeff, output)| *coeff * output)
            .sum();

        let prev_sample = current_sample_coeff * sample - dt * weighted_noise;
        if let Some(inference) = self.inference.as_mut() {
            inference.steps_taken += 1;
        }
        Ok(prev_sample)
    }
}

impl Scheduler for LMSDiscreteScheduler {
    fn set_timesteps(&mut self, inference_steps: usize) -> Result<&[usize]> {
        let positions = self.schedule.inference_positions(inference_steps)?;
        let timesteps = super::round_timesteps(&positions);
        let init_noise_sigma = (1. / (1. - self.schedule.alphas_cumprod[timesteps[0]])).sqrt();
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| self.schedule.sigmas[t]).collect();
        sigmas.push(0.);
        self.history.clear();
        let inference = self.inference.insert(InferenceSchedule {
            timesteps,
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

    /// Divides by `sqrt(alpha_prod_t * (sigma^2 + 1))`, the standard deviation
    /// of a variance-preserving sample. It is one for a well-formed schedule.
    fn scale_model_input(&self, sample: &Tensor, timestep: usize) -> Result<Tensor> {
        let inference = self.inference.as_ref().ok_or(Error::TimestepsNotSet)?;
        let step_index = inference.step_index(timestep)?;
        let sigma = inference.sigmas[step_index];
        let alpha_prod_t = self.schedule.alphas_cumprod[timestep];
        Ok(sample / (alpha_prod_t * (sigma.powi(2) + 1.)).sqrt())
    }

    fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        self.step_with_order(model_output, timestep, sample, self.config.order)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let inference = self.inference.as_ref().ok_or(Error::TimestepsNotSet)?;
        inference.step_index(timestep)?;
        let alpha_prod_t = self.schedule.alphas_cumprod[timestep];
        Ok(alpha_prod_t.sqrt() * original + (1. - alpha_prod_t).sqrt() * noise)
    }

    fn state(&self) -> SchedulerState {
        state_of(&self.inference)
    }
}
