//! # Text-to-image generation
//!
//! The denoising loop: encode the prompt, sample the initial latents, then
//! alternate unet predictions and scheduler steps before decoding the final
//! latents into an image.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::registry::ModelRegistry;
use crate::config::{GenerationParams, NoiseScheduleConfig, PipelineConfig, SchedulerKind};
use crate::error::{Error, Result};
use crate::models::vae::GeneratedImage;
use crate::schedulers::build_scheduler;
use crate::tensor_ops::sample_gaussian;

/// A cooperative cancellation signal, polled once per denoising step.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Tokenizing,
    Encoding,
    InitializingLatents,
    Diffusing,
    Decoding,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Never decreases over a generation, in `[0, 1]`.
    pub fraction: f64,
    pub phase: Phase,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

struct ProgressReporter<'a> {
    callback: &'a (dyn Fn(Progress) + Send + Sync),
    fraction: f64,
}

impl<'a> ProgressReporter<'a> {
    fn new(callback: &'a (dyn Fn(Progress) + Send + Sync)) -> Self {
        Self { callback, fraction: 0. }
    }

    fn report(&mut self, phase: Phase, fraction: f64) {
        self.fraction = self.fraction.max(fraction.clamp(0., 1.));
        (self.callback)(Progress { fraction: self.fraction, phase })
    }

    fn phase(&mut self, phase: Phase) {
        self.report(phase, self.fraction)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    prompt: String,
    negative_prompt: Option<String>,
    params: GenerationParams,
    cancellation: CancellationToken,
}

impl GenerationRequest {
    pub fn new<S: Into<String>>(prompt: S, params: GenerationParams) -> Result<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(Error::config("prompt cannot be empty"));
        }
        Ok(Self { prompt, negative_prompt: None, params, cancellation: CancellationToken::new() })
    }

    /// Uses the encoding of `negative_prompt` for the unconditional half of
    /// the guidance instead of the prompt one.
    pub fn with_negative_prompt<S: Into<String>>(self, negative_prompt: S) -> Self {
        let negative_prompt = Some(negative_prompt.into()).filter(|p| !p.trim().is_empty());
        Self { negative_prompt, ..self }
    }

    pub fn with_cancellation(self, cancellation: CancellationToken) -> Self {
        Self { cancellation, ..self }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt.as_deref()
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

#[derive(Debug)]
pub enum GenerationResult {
    Succeeded(GeneratedImage),
    Cancelled,
    Failed(Error),
}

impl GenerationResult {
    pub fn into_result(self) -> Result<GeneratedImage> {
        match self {
            Self::Succeeded(image) => Ok(image),
            Self::Cancelled => Err(Error::Cancelled),
            Self::Failed(err) => Err(err),
        }
    }
}

/// Classifies generated images, e.g. with an NSFW detector.
pub trait SafetyCheck: Send + Sync {
    fn is_safe(&self, image: &GeneratedImage) -> Result<bool>;
}

#[derive(Clone)]
pub struct StableDiffusionPipeline {
    registry: ModelRegistry,
    scheduler: SchedulerKind,
    noise_schedule: NoiseScheduleConfig,
    safety_checker: Option<Arc<dyn SafetyCheck>>,
}

impl StableDiffusionPipeline {
    pub fn new(registry: ModelRegistry, config: &PipelineConfig) -> Self {
        Self {
            registry,
            scheduler: config.scheduler(),
            noise_schedule: *config.noise_schedule(),
            safety_checker: None,
        }
    }

    /// A pipeline loading its models from the checkpoints named in `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(ModelRegistry::from_config(config), config)
    }

    pub fn with_safety_checker<S: SafetyCheck + 'static>(self, checker: S) -> Self {
        Self { safety_checker: Some(Arc::new(checker)), ..self }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Runs a generation on the calling thread.
    pub fn generate_image(
        &self,
        request: &GenerationRequest,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> GenerationResult {
        let mut reporter = ProgressReporter::new(progress);
        match self.run(request, &mut reporter) {
            Ok(image) => {
                reporter.report(Phase::Completed, 1.);
                GenerationResult::Succeeded(image)
            }
            Err(Error::Cancelled) => {
                tracing::info!("generation cancelled");
                reporter.phase(Phase::Cancelled);
                GenerationResult::Cancelled
            }
            Err(err) => {
                tracing::error!(%err, "generation failed");
                reporter.phase(Phase::Failed);
                GenerationResult::Failed(err)
            }
        }
    }

    /// Runs a generation on a worker thread.
    pub fn spawn(
        &self,
        request: GenerationRequest,
        progress: ProgressCallback,
    ) -> JoinHandle<GenerationResult> {
        let pipeline = self.clone();
        std::thread::spawn(move || pipeline.generate_image(&request, progress.as_ref()))
    }

    fn run(
        &self,
        request: &GenerationRequest,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<GeneratedImage> {
        let params = request.params();
        let cancellation = request.cancellation();

        reporter.phase(Phase::Loading);
        let lease = self.registry.acquire()?;
        let models = lease.lock();
        let _no_grad_guard = tch::no_grad_guard();

        reporter.phase(Phase::Tokenizing);
        let tokens = models.text.tokenize(request.prompt())?;
        let negative_tokens = match request.negative_prompt() {
            Some(text) => Some(models.text.tokenize(text)?),
            None => None,
        };

        reporter.phase(Phase::Encoding);
        let text_embeddings = models.text.encode_ids(&tokens)?;
        let uncond_embeddings = match &negative_tokens {
            Some(tokens) => Some(models.text.encode_ids(tokens)?),
            None => None,
        };

        reporter.phase(Phase::InitializingLatents);
        let mut scheduler = build_scheduler(self.scheduler, &self.noise_schedule)?;
        let timesteps = scheduler.set_timesteps(params.steps())?.to_vec();
        let seed = params.seed().unwrap_or_else(rand::random);
        tracing::info!(seed, steps = params.steps(), scheduler = ?self.scheduler, "starting diffusion");
        scheduler.reseed(seed.wrapping_add(1));
        let mut rng = StdRng::seed_from_u64(seed);
        let mut latents =
            sample_gaussian(&mut rng, &params.latent_dims(), scheduler.init_noise_sigma()?)?;

        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            if cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tracing::debug!(timestep_index, timestep, "denoising step");
            let latent_model_input = scheduler.scale_model_input(&latents, timestep)?;
            let noise_pred = models.unet.predict_with_uncond(
                uncond_embeddings.as_ref(),
                &text_embeddings,
                &latent_model_input,
                timestep,
                params.guidance_scale(),
            )?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            let fraction = (timestep_index + 1) as f64 / timesteps.len() as f64;
            reporter.report(Phase::Diffusing, fraction);
        }
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        reporter.phase(Phase::Decoding);
        let image = models.vae.decode(&latents)?;

        reporter.phase(Phase::Finalizing);
        if let Some(checker) = &self.safety_checker {
            if !checker.is_safe(&image)? {
                return Err(Error::UnsafeContent);
            }
        }
        tracing::info!(width = image.width(), height = image.height(), "generation completed");
        Ok(image)
    }
}
