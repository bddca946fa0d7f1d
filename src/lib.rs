//! `pastiche` is a single-call image-to-image prediction service around a pretrained
//! [Stable Diffusion](https://github.com/CompVis/stable-diffusion) pipeline, using [ONNX Runtime]
//! for inference.
//!
//! Given a source image, a text prompt, and sampling parameters, it produces one or more
//! stylistically transformed output images. The pipeline is loaded once into a [`Predictor`] and
//! reused across predictions:
//! ```ignore
//! use pastiche::{OrtEnvironment, PredictionRequest, Predictor, StableDiffusionOptions, StableDiffusionPipeline};
//!
//! let environment = OrtEnvironment::default().into_arc();
//! let pipeline = StableDiffusionPipeline::new(&environment, "./meinapastel-v1/", StableDiffusionOptions::default())?;
//! let predictor = Predictor::new(pipeline);
//!
//! let paths = predictor.predict(&PredictionRequest::new("./photo.png"))?;
//! ```
//!
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub(crate) mod clip;
pub(crate) mod config;
mod error;
pub mod pipelines;
mod predictor;
mod resize;
pub mod schedulers;

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;

pub use self::error::Error;
pub use self::pipelines::*;
pub use self::predictor::{PredictionRequest, Predictor, DEFAULT_MAX_IMAGE_AREA};
pub use self::resize::resize_to_area;
pub use self::schedulers::{Scheduler, SchedulerKind};

/// The strategy to use for extending the device memory arena.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Subsequent memory allocations extend by larger amounts (multiplied by powers of two)
	#[default]
	PowerOfTwo,
	/// Memory allocations extend only by the requested amount.
	SameAsRequested
}

impl From<ArenaExtendStrategy> for String {
	fn from(val: ArenaExtendStrategy) -> Self {
		match val {
			ArenaExtendStrategy::PowerOfTwo => "kNextPowerOfTwo".to_string(),
			ArenaExtendStrategy::SameAsRequested => "kSameAsRequested".to_string()
		}
	}
}

/// Device options for the CUDA execution provider.
///
/// For low-VRAM devices, it's best to use a float16 UNet with a per-session memory limit:
/// ```ignore
/// CUDADeviceOptions {
/// 	memory_limit: Some(3000000000),
/// 	arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested)
/// }
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CUDADeviceOptions {
	/// The strategy to use for extending the device memory arena. See [`ArenaExtendStrategy`] for more info.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (aka per-model) memory limit. Models may use all available VRAM if a memory limit is not set.
	/// VRAM usage may be higher than the memory limit (though typically not by much).
	pub memory_limit: Option<usize>
}

impl From<CUDADeviceOptions> for ExecutionProvider {
	fn from(val: CUDADeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(arena_extend_strategy) = val.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", arena_extend_strategy);
		}
		if let Some(memory_limit) = val.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		ep
	}
}

/// A device on which to place a diffusion model on.
///
/// If a device is not specified, or a configured execution provider is not available, the model will be placed on the
/// CPU.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	CPU,
	/// Use NVIDIA CUDA as a device. Requires an NVIDIA Kepler GPU or later.
	///
	/// First value is the device ID (which can be set to 0 in most cases). Second value is additional execution
	/// provider parameters, which can be fine tuned for inference on low-VRAM GPUs; see [`CUDADeviceOptions`] for an
	/// example.
	CUDA(usize, Option<CUDADeviceOptions>),
	/// Custom execution provider w/ options. Other execution providers have not been tested and may not work with some
	/// models.
	Custom(ExecutionProvider)
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device, options) => {
				let options = options.unwrap_or_default();
				let mut ep: ExecutionProvider = options.into();
				ep = ep.with("device_id", device.to_string());
				ep
			}
			DiffusionDevice::Custom(ep) => ep
		}
	}
}

/// Select which device each model should be placed on.
///
/// On GPUs with <6 GB VRAM, it may be favorable to place the text encoder and VAE on the CPU so the much more
/// intensive UNet can be placed on the GPU:
/// ```ignore
/// DiffusionDeviceControl {
/// 	unet: DiffusionDevice::CUDA(0, None),
/// 	..Default::default()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DiffusionDeviceControl {
	/// The device on which to place the variational autoencoder encoder.
	pub vae_encoder: DiffusionDevice,
	/// The device on which to place the variational autoencoder decoder.
	pub vae_decoder: DiffusionDevice,
	/// The device on which to place the text encoder (CLIP).
	pub text_encoder: DiffusionDevice,
	/// The device on which to place the UNet.
	pub unet: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Constructs [`DiffusionDeviceControl`] with all models on the same device.
	///
	/// Note that if you are setting `memory_limit` in [`CUDADeviceOptions`], the memory limit is **per session** (aka
	/// per model), NOT for the entire pipeline.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			vae_encoder: device.clone(),
			vae_decoder: device.clone(),
			text_encoder: device.clone(),
			unet: device
		}
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		DiffusionDeviceControl::all(DiffusionDevice::CPU)
	}
}
