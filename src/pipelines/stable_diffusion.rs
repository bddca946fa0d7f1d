// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, path::PathBuf, sync::Arc};

use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb32FImage};
use ndarray::{concatenate, s, Array1, Array4, ArrayD, ArrayView4, Axis, IxDyn};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, Session, SessionBuilder
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
	clip::CLIPStandardTokenizer,
	config::{DiffusionFramework, DiffusionPipelineConfig, StableDiffusionConfig, TokenizerConfig},
	schedulers::{DiffusionScheduler, Scheduler},
	DiffusionDeviceControl, Img2ImgOptions, Img2ImgPipeline, Prompt
};

/// The name of the pipeline description file expected inside a model directory.
pub const PIPELINE_CONFIG_FILENAME: &str = "pastiche.json";

/// Options for the Stable Diffusion pipeline.
#[derive(Default, Debug, Clone)]
pub struct StableDiffusionOptions {
	/// A [`DiffusionDeviceControl`] object, mapping what device to place each model on.
	pub devices: DiffusionDeviceControl
}

/// A [Stable Diffusion](https://github.com/CompVis/stable-diffusion) image-to-image pipeline.
///
/// The pipeline holds the loaded ONNX sessions for the text encoder, UNet, and variational
/// autoencoder; it is the long-lived resource handle a [`Predictor`](crate::Predictor) drives.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use pastiche::{Img2ImgOptions, OrtEnvironment, SchedulerKind, StableDiffusionOptions, StableDiffusionPipeline};
///
/// let environment = OrtEnvironment::default().into_arc();
/// let pipeline = StableDiffusionPipeline::new(&environment, "./meinapastel-v1/", StableDiffusionOptions::default())?;
///
/// let mut scheduler = SchedulerKind::KEulerAncestral.scheduler()?;
/// let image = image::open("photo.png")?;
/// let mut imgs = pipeline.img2img(&Img2ImgOptions::default().with_prompts("pastel portrait", "").with_image(image), &mut scheduler)?;
/// imgs.remove(0).into_rgb8().save("result.png")?;
/// # Ok(())
/// # }
/// ```
pub struct StableDiffusionPipeline {
	tokenizer: CLIPStandardTokenizer,
	text_encoder: Session,
	vae_encoder: Session,
	vae_decoder: Session,
	unet: Session
}

impl StableDiffusionPipeline {
	/// Creates a new Stable Diffusion pipeline, loading models from `root`. The directory must
	/// contain a [`PIPELINE_CONFIG_FILENAME`] file describing the model components.
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>, options: StableDiffusionOptions) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let config: DiffusionPipelineConfig = serde_json::from_str(&fs::read_to_string(root.join(PIPELINE_CONFIG_FILENAME))?)?;
		let config: StableDiffusionConfig = match config {
			DiffusionPipelineConfig::StableDiffusion {
				framework: DiffusionFramework::Onnx,
				inner
			} => inner
		};

		let tokenizer = match &config.tokenizer {
			TokenizerConfig::CLIPTokenizer {
				path,
				model_max_length,
				bos_token,
				eos_token
			} => CLIPStandardTokenizer::new(root.join(path), *model_max_length, *bos_token, *eos_token)?
		};

		tracing::info!("loading pipeline from `{}`", root.display());

		let text_encoder = SessionBuilder::new(environment)?
			.with_execution_providers([options.devices.text_encoder.clone().into()])?
			.with_model_from_file(root.join(&config.text_encoder.path))?;

		let vae_encoder = SessionBuilder::new(environment)?
			.with_execution_providers([options.devices.vae_encoder.clone().into()])?
			.with_model_from_file(root.join(&config.vae.encoder))?;

		let vae_decoder = SessionBuilder::new(environment)?
			.with_execution_providers([options.devices.vae_decoder.clone().into()])?
			.with_model_from_file(root.join(&config.vae.decoder))?;

		let unet = SessionBuilder::new(environment)?
			.with_execution_providers([options.devices.unet.clone().into()])?
			.with_model_from_file(root.join(&config.unet.path))?;

		Ok(Self {
			tokenizer,
			text_encoder,
			vae_encoder,
			vae_decoder,
			unet
		})
	}

	/// Encodes the given prompt(s) into an array of text embeddings to be used as input to the
	/// UNet. When classifier-free guidance is in effect, the unconditional (negative prompt)
	/// embeddings are concatenated in front.
	pub fn encode_prompt(&self, prompt: Prompt, do_classifier_free_guidance: bool, negative_prompt: &Prompt) -> anyhow::Result<ArrayD<f32>> {
		assert_eq!(prompt.len(), negative_prompt.len());

		let text_input_ids = self.tokenizer.encode_for_text_model(prompt.0.clone())?.into_dyn();
		let text_embeddings = self.text_encoder.run(vec![InputTensor::from_array(text_input_ids)])?;
		let mut text_embeddings: ArrayD<f32> = text_embeddings[0].try_extract()?.view().to_owned();

		if do_classifier_free_guidance {
			let uncond_input_ids = self.tokenizer.encode_for_text_model(negative_prompt.0.clone())?.into_dyn();
			let uncond_embeddings = self.text_encoder.run(vec![InputTensor::from_array(uncond_input_ids)])?;
			let uncond_embeddings: ArrayD<f32> = uncond_embeddings[0].try_extract()?.view().to_owned();
			text_embeddings = concatenate![Axis(0), uncond_embeddings, text_embeddings];
		}

		Ok(text_embeddings)
	}

	/// Normalizes the reference image into the `[-1, 1]` NCHW tensor the VAE encoder expects. The
	/// latent space is 8x downsampled, so dimensions are snapped down to the nearest multiple of 8
	/// first (and up to 8 for degenerate slivers).
	fn preprocess_reference(&self, image: &DynamicImage) -> Array4<f32> {
		let (width, height) = image.dimensions();
		let target_width = (width - width % 8).max(8);
		let target_height = (height - height % 8).max(8);
		let image = if (target_width, target_height) != (width, height) {
			image.resize_exact(target_width, target_height, FilterType::Lanczos3)
		} else {
			image.clone()
		};
		let image = image.to_rgb32f();
		Array4::from_shape_fn((1, 3, target_height as usize, target_width as usize), |(_, c, y, x)| {
			image.get_pixel(x as u32, y as u32).0[c] * 2.0 - 1.0
		})
	}

	/// Encodes the reference image into scaled initial latents, repeated `batch_size` times along
	/// the batch axis.
	fn encode_image(&self, image: &DynamicImage, batch_size: usize) -> anyhow::Result<Array4<f32>> {
		let reference = self.preprocess_reference(image);
		let latents = self.vae_encoder.run(vec![InputTensor::from_array(reference.into_dyn())])?;
		let latents: OrtOwnedTensor<'_, f32, IxDyn> = latents[0].try_extract()?;
		let latents: Array4<f32> = latents.view().to_owned().into_dimensionality()?;
		let latents = latents * 0.18215;

		let views = vec![latents.view(); batch_size];
		Ok(ndarray::concatenate(Axis(0), &views)?)
	}

	fn to_image(&self, width: u32, height: u32, arr: &Array4<f32>) -> anyhow::Result<DynamicImage> {
		Ok(DynamicImage::ImageRgb32F(
			Rgb32FImage::from_raw(width, height, arr.map(|f| f.clamp(0.0, 1.0)).into_iter().collect::<Vec<_>>())
				.ok_or_else(|| anyhow::anyhow!("failed to construct image"))?
		))
	}

	/// Decodes UNet latents via the variational autoencoder into an array of
	/// [`image::DynamicImage`]s.
	pub fn decode_latents(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Vec<DynamicImage>> {
		let latents = 1.0 / 0.18215 * &latents;

		let mut images = Vec::new();
		for latent_chunk in latents.axis_iter(Axis(0)) {
			let latent_chunk = latent_chunk.into_dyn().insert_axis(Axis(0));
			let image = self.vae_decoder.run(vec![InputTensor::from_array(latent_chunk.to_owned())])?;
			let image: OrtOwnedTensor<'_, f32, IxDyn> = image[0].try_extract()?;
			let f_image: Array4<f32> = image.view().to_owned().into_dimensionality()?;
			let f_image = f_image.permuted_axes([0, 2, 3, 1]) / 2.0 + 0.5;

			// after the permute the layout is NHWC
			let image = self.to_image(f_image.shape()[2] as _, f_image.shape()[1] as _, &f_image)?;
			images.push(image);
		}

		Ok(images)
	}

	/// Generates variations of the reference image set in `options`. Returns a vector of
	/// [`image::DynamicImage`]s using float32 buffers; in most cases, you'll want to convert the
	/// images into RGB8 via `img.into_rgb8()`.
	///
	/// `scheduler` must be a Stable Diffusion-compatible scheduler.
	pub fn img2img<S: DiffusionScheduler>(&self, options: &Img2ImgOptions, scheduler: &mut S) -> anyhow::Result<Vec<DynamicImage>> {
		let steps = options.steps;
		if steps == 0 {
			anyhow::bail!("`steps` must be at least 1");
		}
		if !(0.0..=1.0).contains(&options.strength) {
			anyhow::bail!("`strength` ({}) must be between 0.0 and 1.0", options.strength);
		}
		if options.num_images == 0 {
			anyhow::bail!("`num_images` must be at least 1");
		}
		let reference = options
			.reference_image
			.as_ref()
			.ok_or_else(|| anyhow::anyhow!("no reference image set; see `Img2ImgOptions::with_image`"))?;

		let seed = options.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut rng = StdRng::seed_from_u64(seed);

		let batch_size = options.num_images;
		let do_classifier_free_guidance = options.guidance_scale > 1.0;

		let prompt = Prompt::batched(&options.positive_prompt, batch_size);
		let negative_prompt = Prompt::batched(&options.negative_prompt, batch_size);
		let text_embeddings = self.encode_prompt(prompt, do_classifier_free_guidance, &negative_prompt)?;

		let init_latents = self.encode_image(reference, batch_size)?;

		scheduler.set_timesteps(steps);
		let all_timesteps = scheduler.timesteps().to_owned();

		// the denoising strength decides how far up the noise schedule the reference is pushed;
		// only the retained tail of the schedule is run
		let init_timestep = ((steps as f32 * options.strength) as usize).min(steps);
		let t_start = steps - init_timestep;
		let timesteps = all_timesteps.slice(s![t_start as isize..]);

		let mut latents = match timesteps.first() {
			Some(&latent_timestep) => {
				let noise = Array4::<f32>::random_using(init_latents.raw_dim(), StandardNormal, &mut rng);
				scheduler.add_noise(init_latents.view(), noise.view(), latent_timestep)
			}
			// a strength low enough to retain zero steps degenerates to decode(encode(reference))
			None => init_latents
		};

		for (i, t) in timesteps.indexed_iter() {
			let latent_model_input = if do_classifier_free_guidance {
				concatenate![Axis(0), latents, latents]
			} else {
				latents.clone()
			};
			let latent_model_input = scheduler.scale_model_input(latent_model_input.view(), *t);
			let latent_model_input: ArrayD<f32> = latent_model_input.into_dyn();
			let timestep: ArrayD<f32> = Array1::from_iter([*t]).into_dyn();
			let encoder_hidden_states: ArrayD<f32> = text_embeddings.clone();

			let noise_pred = self.unet.run(vec![
				InputTensor::from_array(latent_model_input),
				InputTensor::from_array(timestep),
				InputTensor::from_array(encoder_hidden_states),
			])?;
			let noise_pred: OrtOwnedTensor<'_, f32, IxDyn> = noise_pred[0].try_extract()?;
			let mut noise_pred: Array4<f32> = noise_pred.view().to_owned().into_dimensionality()?;

			if do_classifier_free_guidance {
				let guided = {
					let split_len = (noise_pred.shape()[0] / 2) as isize;
					let noise_pred_uncond = noise_pred.slice(s![..split_len, .., .., ..]);
					let noise_pred_text = noise_pred.slice(s![split_len.., .., .., ..]);
					&noise_pred_uncond + options.guidance_scale * (&noise_pred_text - &noise_pred_uncond)
				};
				noise_pred = guided;
			}

			let scheduler_output = scheduler.step(noise_pred.view(), *t, latents.view(), &mut rng);
			latents = scheduler_output.prev_sample().to_owned();

			if let Some(callback) = options.progress_callback.as_ref() {
				if !callback(i, *t) {
					tracing::debug!(step = i, "generation cancelled");
					break;
				}
			}
		}

		self.decode_latents(latents.view())
	}
}

impl Img2ImgPipeline for StableDiffusionPipeline {
	fn img2img(&self, options: &Img2ImgOptions, scheduler: &mut Scheduler) -> anyhow::Result<Vec<DynamicImage>> {
		StableDiffusionPipeline::img2img(self, options, scheduler)
	}
}
