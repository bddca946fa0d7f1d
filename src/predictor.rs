//! The prediction surface: one request in, a list of image paths out.

use std::env;
use std::path::{Path, PathBuf};

use image::{io::Reader as ImageReader, DynamicImage};
use rand::Rng;
use rayon::prelude::*;

use crate::{resize_to_area, Error, Img2ImgOptions, Img2ImgPipeline, SchedulerKind};

/// The default pixel-area budget for input images (1024 × 768). Larger inputs are downscaled
/// before inference to bound memory and compute cost; see
/// [`resize_to_area`](crate::resize_to_area).
pub const DEFAULT_MAX_IMAGE_AREA: u64 = 786_432;

/// Parameters for a single prediction.
///
/// Defaults mirror the hosted surface of the model: a conservative denoising strength so outputs
/// stay close to the reference image, 25 steps, and classifier-free guidance at 7.0.
#[derive(Debug, Clone)]
pub struct PredictionRequest {
	/// Input prompt.
	pub prompt: String,
	/// Input negative prompt.
	pub negative_prompt: String,
	/// Path of the initial image to generate variations of.
	pub image: PathBuf,
	/// Prompt strength when providing the image. 1.0 corresponds to full destruction of the
	/// information in the initial image. Must be within `[0, 1]`.
	pub prompt_strength: f32,
	/// Number of images to output, 1 to 8. Higher numbers of outputs may exhaust device memory, as
	/// all outputs are generated in a single batched invocation.
	pub num_outputs: usize,
	/// Number of denoising steps, 1 to 500.
	pub num_inference_steps: usize,
	/// Scale for classifier-free guidance, 1 to 20.
	pub guidance_scale: f32,
	/// The scheduler to sample with.
	pub scheduler: SchedulerKind,
	/// Random seed; leave `None` to draw a random one. The drawn seed is logged so a run can be
	/// reproduced.
	pub seed: Option<u64>,
	/// Maximum input image size, in pixels; if the image exceeds it, it will be downscaled.
	pub max_image_size: u64
}

impl PredictionRequest {
	/// A request for the given input image, with every other parameter at its default.
	pub fn new(image: impl Into<PathBuf>) -> Self {
		Self {
			prompt: "masterpiece, best quality, ultra detailed".to_string(),
			negative_prompt: "lowres, bad anatomy, bad hands, worst quality, blurry".to_string(),
			image: image.into(),
			prompt_strength: 0.26,
			num_outputs: 1,
			num_inference_steps: 25,
			guidance_scale: 7.0,
			scheduler: SchedulerKind::default(),
			seed: None,
			max_image_size: DEFAULT_MAX_IMAGE_AREA
		}
	}
}

/// The serving context: owns a loaded [`Img2ImgPipeline`] for the life of the process and runs one
/// prediction per call, writing outputs as `out-0.png`, `out-1.png`, … in its output directory
/// (the system temporary directory unless overridden).
pub struct Predictor<P> {
	pipeline: P,
	output_dir: PathBuf
}

impl<P: Img2ImgPipeline + Sync> Predictor<P> {
	/// Creates a predictor around an already-loaded pipeline.
	pub fn new(pipeline: P) -> Self {
		Self {
			pipeline,
			output_dir: env::temp_dir()
		}
	}

	/// Sets the directory output images are written to.
	pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
		self.output_dir = output_dir.into();
		self
	}

	/// The directory output images are written to.
	pub fn output_dir(&self) -> &Path {
		&self.output_dir
	}

	/// Runs a single prediction, returning the paths of the generated images in output order.
	///
	/// The input image is decoded, converted to RGB, and downscaled to the request's pixel-area
	/// budget before being handed to the pipeline; all `num_outputs` images are generated in one
	/// batched pipeline invocation.
	///
	/// # Errors
	/// Parameter and input-image validation failures are reported as the corresponding [`Error`]
	/// variants; pipeline failures are passed through as [`Error::Pipeline`] without retry.
	pub fn predict(&self, request: &PredictionRequest) -> Result<Vec<PathBuf>, Error> {
		validate(request)?;

		let seed = request.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		tracing::info!(seed, "using seed");

		let image = ImageReader::open(&request.image)
			.map_err(|e| Error::ImageLoad {
				path: request.image.clone(),
				source: image::ImageError::IoError(e)
			})?
			.decode()
			.map_err(|e| Error::ImageLoad {
				path: request.image.clone(),
				source: e
			})?;
		let image = DynamicImage::ImageRgb8(image.to_rgb8());
		let image = resize_to_area(image, request.max_image_size)?;

		let mut scheduler = request.scheduler.scheduler().map_err(Error::Pipeline)?;
		let options = Img2ImgOptions::default()
			.with_prompts(request.prompt.clone(), request.negative_prompt.clone())
			.with_image(image)
			.with_strength(request.prompt_strength)
			.with_steps(request.num_inference_steps)
			.with_guidance_scale(request.guidance_scale)
			.with_num_images(request.num_outputs)
			.with_seed(seed)
			.callback_progress(|step, timestep| {
				tracing::debug!(step, timestep, "denoising");
				true
			});

		let images = self.pipeline.img2img(&options, &mut scheduler).map_err(Error::Pipeline)?;

		images
			.par_iter()
			.enumerate()
			.map(|(i, image)| {
				let path = self.output_dir.join(format!("out-{i}.png"));
				image.clone().into_rgb8().save(&path).map_err(|e| Error::ImageSave {
					path: path.clone(),
					source: e
				})?;
				Ok(path)
			})
			.collect::<Result<Vec<_>, Error>>()
	}
}

fn validate(request: &PredictionRequest) -> Result<(), Error> {
	if !(1..=8).contains(&request.num_outputs) {
		return Err(Error::InvalidParameter {
			name: "num_outputs",
			value: request.num_outputs.to_string(),
			expected: "between 1 and 8"
		});
	}
	if !(1..=500).contains(&request.num_inference_steps) {
		return Err(Error::InvalidParameter {
			name: "num_inference_steps",
			value: request.num_inference_steps.to_string(),
			expected: "between 1 and 500"
		});
	}
	if !(1.0..=20.0).contains(&request.guidance_scale) {
		return Err(Error::InvalidParameter {
			name: "guidance_scale",
			value: request.guidance_scale.to_string(),
			expected: "between 1 and 20"
		});
	}
	if !(0.0..=1.0).contains(&request.prompt_strength) {
		return Err(Error::InvalidParameter {
			name: "prompt_strength",
			value: request.prompt_strength.to_string(),
			expected: "between 0 and 1"
		});
	}
	if request.max_image_size == 0 {
		return Err(Error::InvalidParameter {
			name: "max_image_size",
			value: request.max_image_size.to_string(),
			expected: "a positive pixel count"
		});
	}
	Ok(())
}
