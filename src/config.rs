//! # Pipeline configuration
//!
//! Configuration values are plain immutable data. Every `with_*` method
//! validates its input and returns a new value, so a config or set of
//! generation parameters that exists is always a valid one.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schedulers::{BetaSchedule, PredictionType};

pub const MAX_INFERENCE_STEPS: usize = 1000;
pub const MAX_GUIDANCE_SCALE: f64 = 20.;

/// Where the model sessions run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    #[default]
    Cpu,
    /// CUDA or Metal when available, the CPU otherwise.
    Accelerated,
}

/// The denoising algorithm used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Deterministic linear multistep sampler.
    #[default]
    Lms,
    /// Stochastic ancestral sampler with Euler steps.
    EulerAncestral,
}

/// Parameters of the noise schedule the models were trained with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseScheduleConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// number of diffusion steps used to train the model.
    pub train_timesteps: usize,
    /// prediction type of the denoising model
    pub prediction_type: PredictionType,
    /// Maximum number of model outputs combined by the multistep sampler.
    pub order: usize,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            train_timesteps: 1000,
            prediction_type: PredictionType::Epsilon,
            order: 4,
        }
    }
}

impl NoiseScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.train_timesteps < 2 {
            return Err(Error::config(format!(
                "train_timesteps must be at least 2, got {}",
                self.train_timesteps
            )));
        }
        if !(self.beta_start > 0. && self.beta_start <= self.beta_end && self.beta_end < 1.) {
            return Err(Error::config(format!(
                "betas must satisfy 0 < beta_start <= beta_end < 1, got {} and {}",
                self.beta_start, self.beta_end
            )));
        }
        if self.order == 0 {
            return Err(Error::config("solver order must be at least 1"));
        }
        Ok(())
    }
}

/// Per-request generation hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGenerationParams", into = "RawGenerationParams")]
pub struct GenerationParams {
    width: i64,
    height: i64,
    steps: usize,
    guidance_scale: f64,
    seed: Option<u64>,
}

impl GenerationParams {
    pub fn new(width: i64, height: i64, steps: usize, guidance_scale: f64) -> Result<Self> {
        validate_side("width", width)?;
        validate_side("height", height)?;
        validate_steps(steps)?;
        validate_guidance(guidance_scale)?;
        Ok(Self { width, height, steps, guidance_scale, seed: None })
    }

    pub fn with_size(self, width: i64, height: i64) -> Result<Self> {
        validate_side("width", width)?;
        validate_side("height", height)?;
        Ok(Self { width, height, ..self })
    }

    pub fn with_steps(self, steps: usize) -> Result<Self> {
        validate_steps(steps)?;
        Ok(Self { steps, ..self })
    }

    pub fn with_guidance_scale(self, guidance_scale: f64) -> Result<Self> {
        validate_guidance(guidance_scale)?;
        Ok(Self { guidance_scale, ..self })
    }

    pub fn with_seed(self, seed: Option<u64>) -> Self {
        Self { seed, ..self }
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn guidance_scale(&self) -> f64 {
        self.guidance_scale
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// The `[1, 4, height / 8, width / 8]` shape of the latents.
    pub fn latent_dims(&self) -> [i64; 4] {
        [1, 4, self.height / 8, self.width / 8]
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { width: 512, height: 512, steps: 30, guidance_scale: 7.5, seed: None }
    }
}

fn validate_side(name: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::config(format!("{name} must be positive, got {value}")));
    }
    if value % 8 != 0 {
        return Err(Error::config(format!("{name} must be a multiple of 8, got {value}")));
    }
    Ok(())
}

fn validate_steps(steps: usize) -> Result<()> {
    if steps == 0 || steps > MAX_INFERENCE_STEPS {
        return Err(Error::config(format!(
            "number of inference steps must be in 1..={MAX_INFERENCE_STEPS}, got {steps}"
        )));
    }
    Ok(())
}

fn validate_guidance(scale: f64) -> Result<()> {
    if !(scale > 0. && scale <= MAX_GUIDANCE_SCALE) {
        return Err(Error::config(format!(
            "guidance scale must be in (0, {MAX_GUIDANCE_SCALE}], got {scale}"
        )));
    }
    Ok(())
}

// Serde goes through this so that deserialized params are validated too.
#[derive(Serialize, Deserialize)]
struct RawGenerationParams {
    width: i64,
    height: i64,
    steps: usize,
    guidance_scale: f64,
    #[serde(default)]
    seed: Option<u64>,
}

impl TryFrom<RawGenerationParams> for GenerationParams {
    type Error = Error;

    fn try_from(raw: RawGenerationParams) -> Result<Self> {
        Ok(Self::new(raw.width, raw.height, raw.steps, raw.guidance_scale)?.with_seed(raw.seed))
    }
}

impl From<GenerationParams> for RawGenerationParams {
    fn from(p: GenerationParams) -> Self {
        Self {
            width: p.width,
            height: p.height,
            steps: p.steps,
            guidance_scale: p.guidance_scale,
            seed: p.seed,
        }
    }
}

/// Resolved checkpoint locations, all of which existed when resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub vocab: PathBuf,
    pub merges: PathBuf,
    pub text_encoder: PathBuf,
    pub unet: PathBuf,
    pub vae_decoder: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    model_dir: PathBuf,
    #[serde(default)]
    vocab: Option<PathBuf>,
    #[serde(default)]
    merges: Option<PathBuf>,
    #[serde(default)]
    text_encoder: Option<PathBuf>,
    #[serde(default)]
    unet: Option<PathBuf>,
    #[serde(default)]
    vae_decoder: Option<PathBuf>,
    #[serde(default)]
    execution_target: ExecutionTarget,
    #[serde(default)]
    scheduler: SchedulerKind,
    #[serde(default)]
    noise_schedule: NoiseScheduleConfig,
    #[serde(default = "default_hidden_size")]
    text_hidden_size: i64,
    #[serde(default)]
    params: GenerationParams,
}

fn default_hidden_size() -> i64 {
    768
}

impl PipelineConfig {
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
            vocab: None,
            merges: None,
            text_encoder: None,
            unet: None,
            vae_decoder: None,
            execution_target: ExecutionTarget::default(),
            scheduler: SchedulerKind::default(),
            noise_schedule: NoiseScheduleConfig::default(),
            text_hidden_size: default_hidden_size(),
            params: GenerationParams::default(),
        }
    }

    /// Reads a JSON config file and validates every value in it.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = crate::utils::file_open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.noise_schedule.validate()?;
        if config.text_hidden_size <= 0 {
            return Err(Error::config("text_hidden_size must be positive"));
        }
        Ok(config)
    }

    pub fn with_vocab<P: AsRef<Path>>(self, path: P) -> Self {
        Self { vocab: Some(path.as_ref().to_path_buf()), ..self }
    }

    pub fn with_merges<P: AsRef<Path>>(self, path: P) -> Self {
        Self { merges: Some(path.as_ref().to_path_buf()), ..self }
    }

    pub fn with_text_encoder<P: AsRef<Path>>(self, path: P) -> Self {
        Self { text_encoder: Some(path.as_ref().to_path_buf()), ..self }
    }

    pub fn with_unet<P: AsRef<Path>>(self, path: P) -> Self {
        Self { unet: Some(path.as_ref().to_path_buf()), ..self }
    }

    pub fn with_vae_decoder<P: AsRef<Path>>(self, path: P) -> Self {
        Self { vae_decoder: Some(path.as_ref().to_path_buf()), ..self }
    }

    pub fn with_execution_target(self, execution_target: ExecutionTarget) -> Self {
        Self { execution_target, ..self }
    }

    pub fn with_scheduler(self, scheduler: SchedulerKind) -> Self {
        Self { scheduler, ..self }
    }

    pub fn with_noise_schedule(self, noise_schedule: NoiseScheduleConfig) -> Result<Self> {
        noise_schedule.validate()?;
        Ok(Self { noise_schedule, ..self })
    }

    pub fn with_text_hidden_size(self, text_hidden_size: i64) -> Result<Self> {
        if text_hidden_size <= 0 {
            return Err(Error::config("text_hidden_size must be positive"));
        }
        Ok(Self { text_hidden_size, ..self })
    }

    pub fn with_params(self, params: GenerationParams) -> Self {
        Self { params, ..self }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn execution_target(&self) -> ExecutionTarget {
        self.execution_target
    }

    pub fn scheduler(&self) -> SchedulerKind {
        self.scheduler
    }

    pub fn noise_schedule(&self) -> &NoiseScheduleConfig {
        &self.noise_schedule
    }

    pub fn text_hidden_size(&self) -> i64 {
        self.text_hidden_size
    }

    pub fn params(&self) -> GenerationParams {
        self.params
    }

    /// Resolves every checkpoint path, using the defaults under the model
    /// directory for components without an override, and checks that the
    /// files exist.
    pub fn resolve_paths(&self) -> Result<ModelPaths> {
        if self.model_dir.as_os_str().is_empty() {
            return Err(Error::config("model directory cannot be empty"));
        }
        if !self.model_dir.is_dir() {
            return Err(Error::config(format!(
                "model directory not found: {}",
                self.model_dir.display()
            )));
        }
        let resolve = |name: &str, over: &Option<PathBuf>, default: &str| -> Result<PathBuf> {
            let path = over.clone().unwrap_or_else(|| self.model_dir.join(default));
            if !path.is_file() {
                return Err(Error::config(format!("{name} not found: {}", path.display())));
            }
            Ok(path)
        };
        Ok(ModelPaths {
            vocab: resolve("tokenizer vocabulary", &self.vocab, "tokenizer/vocab.json")?,
            merges: resolve("tokenizer merges", &self.merges, "tokenizer/merges.txt")?,
            text_encoder: resolve("text encoder", &self.text_encoder, "text_encoder.pt")?,
            unet: resolve("unet", &self.unet, "unet.pt")?,
            vae_decoder: resolve("vae decoder", &self.vae_decoder, "vae_decoder.pt")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn params_validation() {
        assert!(GenerationParams::new(512, 512, 30, 7.5).is_ok());
        assert!(GenerationParams::new(8, 16, 1, 20.).is_ok());

        for (w, h, steps, scale) in [
            (511, 512, 30, 7.5),
            (512, 0, 30, 7.5),
            (-8, 512, 30, 7.5),
            (512, 512, 0, 7.5),
            (512, 512, 1001, 7.5),
            (512, 512, 30, 0.),
            (512, 512, 30, -1.),
            (512, 512, 30, 20.5),
            (512, 512, 30, f64::NAN),
        ] {
            let err = GenerationParams::new(w, h, steps, scale).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{w} {h} {steps} {scale}");
        }
    }

    #[test]
    fn with_returns_new_values() {
        let p = GenerationParams::default();
        let q = p.with_size(256, 128).unwrap().with_steps(4).unwrap().with_seed(Some(7));
        assert_eq!(p.width(), 512);
        assert_eq!((q.width(), q.height(), q.steps(), q.seed()), (256, 128, 4, Some(7)));
        assert_eq!(q.latent_dims(), [1, 4, 16, 32]);
        assert!(q.with_guidance_scale(0.).is_err());
        assert!(q.with_size(100, 128).is_err());
    }

    #[test]
    fn params_json_is_validated() {
        let ok: GenerationParams = serde_json::from_str(
            r#"{"width": 64, "height": 64, "steps": 2, "guidance_scale": 1.0, "seed": 3}"#,
        )
        .unwrap();
        assert_eq!(ok.seed(), Some(3));
        let bad = serde_json::from_str::<GenerationParams>(
            r#"{"width": 511, "height": 64, "steps": 2, "guidance_scale": 1.0}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn noise_schedule_validation() {
        assert!(NoiseScheduleConfig::default().validate().is_ok());
        let bad = NoiseScheduleConfig { train_timesteps: 1, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = NoiseScheduleConfig { beta_start: 0.02, beta_end: 0.01, ..Default::default() };
        assert!(bad.validate().is_err());
        let bad = NoiseScheduleConfig { order: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn missing_model_dir() {
        let config = PipelineConfig::new("/definitely/not/a/model/dir");
        let err = config.resolve_paths().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(PipelineConfig::new("").resolve_paths().is_err());
    }

    #[test]
    fn resolve_defaults_and_overrides() {
        let dir = std::env::temp_dir().join(format!("sd-config-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("tokenizer")).unwrap();
        for f in ["tokenizer/vocab.json", "tokenizer/merges.txt", "text_encoder.pt", "unet.pt"] {
            std::fs::write(dir.join(f), b"").unwrap();
        }
        let config = PipelineConfig::new(&dir);
        // The decoder is missing.
        assert!(config.resolve_paths().is_err());

        let vae = dir.join("custom_vae.pt");
        std::fs::write(&vae, b"").unwrap();
        let paths = config.with_vae_decoder(&vae).resolve_paths().unwrap();
        assert_eq!(paths.vae_decoder, vae);
        assert_eq!(paths.unet, dir.join("unet.pt"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn config_json() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"model_dir": "models", "scheduler": "euler_ancestral",
                "execution_target": "accelerated",
                "params": {"width": 64, "height": 64, "steps": 2, "guidance_scale": 1.0}}"#,
        )
        .unwrap();
        assert_eq!(config.scheduler(), SchedulerKind::EulerAncestral);
        assert_eq!(config.execution_target(), ExecutionTarget::Accelerated);
        assert_eq!(config.text_hidden_size(), 768);
        assert_eq!(config.noise_schedule().train_timesteps, 1000);
        assert_eq!(config.params().width(), 64);
    }
}
