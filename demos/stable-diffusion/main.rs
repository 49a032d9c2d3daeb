// Text-to-image generation with Stable Diffusion over TorchScript checkpoints.
//
// The model directory is expected to contain:
//
//   tokenizer/vocab.json    the CLIP vocabulary
//   tokenizer/merges.txt    the CLIP bpe merges
//   text_encoder.pt         traced text encoder: input_ids -> last hidden state
//   unet.pt                 traced unet: (latent, timestep, text_embed) -> noise
//   vae_decoder.pt          traced vae decoder: latent -> image
//
// The tokenizer files can be found in the tokenizer/ directory of
// https://huggingface.co/runwayml/stable-diffusion-v1-5
// The three modules can be exported from python with torch.jit.trace, e.g. for the decoder:
//
//   vae = AutoencoderKL.from_pretrained("runwayml/stable-diffusion-v1-5", subfolder="vae")
//   torch.jit.trace(lambda z: vae.decode(z).sample, torch.randn(1, 4, 64, 64)).save("vae_decoder.pt")
use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use diffusers_txt2img::{
    ExecutionTarget, GenerationRequest, GenerationResult, PipelineConfig, Progress, SchedulerKind,
    StableDiffusionPipeline,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The prompt to be used for image generation.
    #[arg(long, default_value = "A very realistic photo of a rusty robot walking on a sandy beach")]
    prompt: String,

    /// What the image should not look like.
    #[arg(long)]
    negative_prompt: Option<String>,

    /// The directory holding the tokenizer files and the TorchScript modules.
    #[arg(long, default_value = "data")]
    model_dir: String,

    /// A JSON pipeline configuration, the other flags override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// When set, use the CPU even if some accelerated devices are available.
    #[arg(long)]
    cpu: bool,

    /// Use the ancestral Euler sampler rather than the linear multistep one.
    #[arg(long)]
    ancestral: bool,

    /// The height in pixels of the generated image.
    #[arg(long)]
    height: Option<i64>,

    /// The width in pixels of the generated image.
    #[arg(long)]
    width: Option<i64>,

    /// The number of steps to run the diffusion for.
    #[arg(long)]
    n_steps: Option<usize>,

    /// The classifier-free guidance scale.
    #[arg(long)]
    guidance_scale: Option<f64>,

    /// The random seed, drawn at random when not set.
    #[arg(long)]
    seed: Option<u64>,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "sd_final.png")]
    final_image: String,
}

fn build_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let config = match &args.config {
        Some(file) => PipelineConfig::from_json_file(file)?,
        None => PipelineConfig::new(&args.model_dir),
    };
    let config = if args.cpu {
        config.with_execution_target(ExecutionTarget::Cpu)
    } else if args.config.is_none() {
        config.with_execution_target(ExecutionTarget::Accelerated)
    } else {
        config
    };
    let config =
        if args.ancestral { config.with_scheduler(SchedulerKind::EulerAncestral) } else { config };

    let mut params = config.params();
    if args.width.is_some() || args.height.is_some() {
        let width = args.width.unwrap_or(params.width());
        let height = args.height.unwrap_or(params.height());
        params = params.with_size(width, height)?;
    }
    if let Some(n_steps) = args.n_steps {
        params = params.with_steps(n_steps)?;
    }
    if let Some(guidance_scale) = args.guidance_scale {
        params = params.with_guidance_scale(guidance_scale)?;
    }
    Ok(config.with_params(params.with_seed(args.seed)))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&args)?;
    let pipeline = StableDiffusionPipeline::from_config(&config);

    let mut request = GenerationRequest::new(args.prompt.as_str(), config.params())?;
    if let Some(negative_prompt) = &args.negative_prompt {
        request = request.with_negative_prompt(negative_prompt.as_str());
    }

    let progress = Arc::new(|p: Progress| {
        print!("\r{:?} {:5.1}%", p.phase, 100. * p.fraction);
        let _ = std::io::stdout().flush();
    });
    let handle = pipeline.spawn(request, progress);
    let result = match handle.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("generation thread panicked"),
    };
    println!();

    match result {
        GenerationResult::Succeeded(image) => {
            image.save(&args.final_image)?;
            println!("Saved {}x{} image to {}", image.width(), image.height(), args.final_image);
        }
        GenerationResult::Cancelled => println!("Generation cancelled"),
        GenerationResult::Failed(err) => return Err(err.into()),
    }
    Ok(())
}
