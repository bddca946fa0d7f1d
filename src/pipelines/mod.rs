//! Diffusion pipelines.

use std::fmt::Debug;
use std::ops::Deref;

use image::DynamicImage;

mod stable_diffusion;

pub use self::stable_diffusion::{StableDiffusionOptions, StableDiffusionPipeline, PIPELINE_CONFIG_FILENAME};
use crate::schedulers::Scheduler;

/// Text prompt(s) used as input in diffusion pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prompt(pub(crate) Vec<String>);

impl Prompt {
	/// The same prompt, repeated for each image in a batch.
	pub fn batched(prompt: impl Into<String>, batch_size: usize) -> Self {
		Self(vec![prompt.into(); batch_size])
	}
}

impl Deref for Prompt {
	type Target = Vec<String>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl From<&str> for Prompt {
	fn from(value: &str) -> Self {
		Self(vec![value.to_string()])
	}
}

impl From<String> for Prompt {
	fn from(value: String) -> Self {
		Self(vec![value])
	}
}

impl From<Vec<String>> for Prompt {
	fn from(value: Vec<String>) -> Self {
		Self(value)
	}
}

/// Options for a single image-to-image invocation.
///
/// The reference image is expected to have been brought within the caller's pixel-area budget
/// already (see [`resize_to_area`](crate::resize_to_area)); the pipeline will only snap its
/// dimensions down to the nearest multiple of 8, as the latent space requires.
pub struct Img2ImgOptions {
	pub(crate) positive_prompt: String,
	pub(crate) negative_prompt: String,
	pub(crate) reference_image: Option<DynamicImage>,
	/// How much the output departs from the reference image; 1.0 corresponds to full destruction
	/// of the information in the reference.
	pub(crate) strength: f32,
	pub(crate) steps: usize,
	pub(crate) guidance_scale: f32,
	pub(crate) num_images: usize,
	pub(crate) seed: Option<u64>,
	pub(crate) progress_callback: Option<Box<dyn Fn(usize, f32) -> bool>>
}

impl Default for Img2ImgOptions {
	fn default() -> Self {
		Self {
			positive_prompt: String::new(),
			negative_prompt: String::new(),
			reference_image: None,
			strength: 0.26,
			steps: 25,
			guidance_scale: 7.0,
			num_images: 1,
			seed: None,
			progress_callback: None
		}
	}
}

impl Debug for Img2ImgOptions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Img2ImgOptions")
			.field("positive_prompt", &self.positive_prompt)
			.field("negative_prompt", &self.negative_prompt)
			.field("strength", &self.strength)
			.field("steps", &self.steps)
			.field("guidance_scale", &self.guidance_scale)
			.field("num_images", &self.num_images)
			.field("seed", &self.seed)
			.finish_non_exhaustive()
	}
}

impl Img2ImgOptions {
	/// Set the prompt(s) to use when generating the image.
	pub fn with_prompts(mut self, positive_prompt: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
		self.positive_prompt = positive_prompt.into();
		self.negative_prompt = negative_prompt.into();
		self
	}

	/// Set the reference image to generate variations of.
	pub fn with_image(mut self, image: DynamicImage) -> Self {
		self.reference_image = Some(image);
		self
	}

	/// Set the denoising strength. 1.0 corresponds to full destruction of the information in the
	/// reference image.
	pub fn with_strength(mut self, strength: f32) -> Self {
		self.strength = strength;
		self
	}

	/// The number of steps to take to generate the image. More steps typically yields higher
	/// quality images.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}

	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model
	/// more freedom, but the output may not match the prompt. A higher guidance scale means the
	/// model will match the prompt(s) more strictly, but may introduce artifacts.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}

	/// The number of images to generate in one batched invocation.
	pub fn with_num_images(mut self, num_images: usize) -> Self {
		self.num_images = num_images;
		self
	}

	/// Set with given seed, so that each run generates the same image.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}

	/// Use a random seed, so that each run generates a different image.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}

	/// A simple callback for reporting progress; called once per denoising step with the step
	/// number and this step's timestep. Return `false` to cancel generation.
	pub fn callback_progress<F>(mut self, callback: F) -> Self
	where
		F: Fn(usize, f32) -> bool + 'static
	{
		self.progress_callback = Some(Box::new(callback));
		self
	}
}

// accessors, for pipeline implementations outside this crate (and mocks in tests)
impl Img2ImgOptions {
	/// The positive prompt.
	pub fn positive_prompt(&self) -> &str {
		&self.positive_prompt
	}

	/// The negative prompt.
	pub fn negative_prompt(&self) -> &str {
		&self.negative_prompt
	}

	/// The reference image, if one has been set.
	pub fn reference_image(&self) -> Option<&DynamicImage> {
		self.reference_image.as_ref()
	}

	/// The denoising strength.
	pub fn strength(&self) -> f32 {
		self.strength
	}

	/// The number of denoising steps.
	pub fn steps(&self) -> usize {
		self.steps
	}

	/// The classifier-free guidance scale.
	pub fn guidance_scale(&self) -> f32 {
		self.guidance_scale
	}

	/// The number of images generated per invocation.
	pub fn num_images(&self) -> usize {
		self.num_images
	}

	/// The seed, if a fixed one has been set.
	pub fn seed(&self) -> Option<u64> {
		self.seed
	}
}

/// An image-to-image diffusion pipeline: the explicitly owned handle to the loaded model state.
///
/// [`StableDiffusionPipeline`] is the ONNX Runtime implementation; tests substitute a mock. A
/// pipeline is constructed once and borrowed for each invocation; there is no global model state.
pub trait Img2ImgPipeline {
	/// Generates `options.num_images` variations of the reference image. Returns images using
	/// float32 buffers; in most cases, you'll want to convert them into RGB8 via `img.into_rgb8()`.
	///
	/// `scheduler` must have been freshly constructed or is otherwise assumed to carry no state
	/// from a previous invocation; `set_timesteps` is driven by the pipeline.
	fn img2img(&self, options: &Img2ImgOptions, scheduler: &mut Scheduler) -> anyhow::Result<Vec<DynamicImage>>;
}
