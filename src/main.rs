use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use pastiche::{
	CUDADeviceOptions, DiffusionDevice, DiffusionDeviceControl, OrtEnvironment, PredictionRequest, Predictor, SchedulerKind, StableDiffusionOptions,
	StableDiffusionPipeline
};
use tracing_subscriber::EnvFilter;

/// Generate stylistic variations of an input image with a Stable Diffusion ONNX pipeline.
#[derive(Parser)]
#[command(name = "pastiche", version)]
struct Args {
	/// Path to the model directory (containing `pastiche.json`).
	#[arg(long)]
	model_dir: PathBuf,

	/// Initial image to generate variations of.
	#[arg(long)]
	image: PathBuf,

	/// Input prompt.
	#[arg(long, default_value = "masterpiece, best quality, ultra detailed")]
	prompt: String,

	/// Input negative prompt.
	#[arg(long, default_value = "lowres, bad anatomy, bad hands, worst quality, blurry")]
	negative_prompt: String,

	/// Prompt strength when providing the image. 1.0 corresponds to full destruction of
	/// information in the initial image.
	#[arg(long, default_value_t = 0.26)]
	prompt_strength: f32,

	/// Number of images to output (1-8). Higher numbers of outputs may exhaust device memory.
	#[arg(long, default_value_t = 1)]
	num_outputs: usize,

	/// Number of denoising steps (1-500).
	#[arg(long, default_value_t = 25)]
	num_inference_steps: usize,

	/// Scale for classifier-free guidance (1-20).
	#[arg(long, default_value_t = 7.0)]
	guidance_scale: f32,

	/// Scheduler to sample with: DPMSolverMultistep, UniPCMultistepScheduler, DDIM, K_EULER,
	/// K_EULER_ANCESTRAL, PNDM, or KLMS.
	#[arg(long, value_parser = parse_scheduler, default_value = "DPMSolverMultistep")]
	scheduler: SchedulerKind,

	/// Random seed. Leave blank to randomize the seed.
	#[arg(long)]
	seed: Option<u64>,

	/// Maximum input image size in pixels; larger images are downscaled before inference.
	#[arg(long, default_value_t = pastiche::DEFAULT_MAX_IMAGE_AREA)]
	max_image_size: u64,

	/// Directory to write `out-N.png` files to. Defaults to the system temporary directory.
	#[arg(long)]
	output_dir: Option<PathBuf>,

	/// Device to run inference on: `cpu`, `cuda`, or `cuda:N`.
	#[arg(long, default_value = "cpu")]
	device: String,

	/// Per-session GPU memory limit, in bytes. Only meaningful with `--device cuda`.
	#[arg(long)]
	gpu_memory_limit: Option<usize>
}

fn parse_scheduler(s: &str) -> anyhow::Result<SchedulerKind> {
	s.parse()
}

fn parse_device(device: &str, gpu_memory_limit: Option<usize>) -> anyhow::Result<DiffusionDevice> {
	if device == "cpu" {
		return Ok(DiffusionDevice::CPU);
	}
	if let Some(rest) = device.strip_prefix("cuda") {
		let device_id = match rest.strip_prefix(':') {
			Some(id) => id.parse::<usize>().with_context(|| format!("invalid CUDA device ID `{id}`"))?,
			None if rest.is_empty() => 0,
			None => anyhow::bail!("unknown device `{device}`; expected `cpu`, `cuda`, or `cuda:N`")
		};
		let options = gpu_memory_limit.map(|memory_limit| CUDADeviceOptions {
			memory_limit: Some(memory_limit),
			..Default::default()
		});
		return Ok(DiffusionDevice::CUDA(device_id, options));
	}
	anyhow::bail!("unknown device `{device}`; expected `cpu`, `cuda`, or `cuda:N`")
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();

	let device = parse_device(&args.device, args.gpu_memory_limit)?;
	let environment = Arc::new(OrtEnvironment::builder().with_name("pastiche").build()?);
	let pipeline = StableDiffusionPipeline::new(
		&environment,
		&args.model_dir,
		StableDiffusionOptions {
			devices: DiffusionDeviceControl::all(device)
		}
	)?;

	let mut predictor = Predictor::new(pipeline);
	if let Some(output_dir) = args.output_dir {
		predictor = predictor.with_output_dir(output_dir);
	}

	let request = PredictionRequest {
		prompt: args.prompt,
		negative_prompt: args.negative_prompt,
		prompt_strength: args.prompt_strength,
		num_outputs: args.num_outputs,
		num_inference_steps: args.num_inference_steps,
		guidance_scale: args.guidance_scale,
		scheduler: args.scheduler,
		seed: args.seed,
		max_image_size: args.max_image_size,
		..PredictionRequest::new(args.image)
	};

	for path in predictor.predict(&request)? {
		println!("{}", path.display());
	}

	Ok(())
}
