//! Schedulers take in the output of a trained model, a sample which the diffusion process is
//! iterating on, and a timestep, and return a denoised sample.
//!
//! * Schedulers define the methodology for iteratively adding noise to an image or for updating a
//!   sample based on model outputs.
//! * Schedulers are often defined by a noise schedule and an update rule to solve the differential
//!   equation solution.
//!
//! The seven schedulers selectable through the prediction surface are enumerated by
//! [`SchedulerKind`]; [`SchedulerKind::scheduler`] constructs one configured for the Stable
//! Diffusion v1 noise schedule.

use ndarray::{concatenate, s, Array1, Array4, ArrayBase, ArrayView1, ArrayView4, Axis};
use rand::Rng;

mod ddim;
mod dpm_solver_multistep;
mod euler_ancestral_discrete;
mod euler_discrete;
mod lms_discrete;
mod pndm;
mod selection;
mod uni_pc_multistep;

pub use self::ddim::{DDIMScheduler, DDIMSchedulerConfig};
pub use self::dpm_solver_multistep::{DPMSolverAlgorithmType, DPMSolverMultistepScheduler, DPMSolverMultistepSchedulerConfig, DPMSolverType};
pub use self::euler_ancestral_discrete::EulerAncestralDiscreteScheduler;
pub use self::euler_discrete::EulerDiscreteScheduler;
pub use self::lms_discrete::LMSDiscreteScheduler;
pub use self::pndm::PNDMScheduler;
pub use self::selection::{Scheduler, SchedulerKind};
pub use self::uni_pc_multistep::{UniPCMultistepScheduler, UniPCMultistepSchedulerConfig, UniPCVariant};

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone)]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule. This is the schedule used by Stable Diffusion v1.
	ScaledLinear,
	/// Glide cosine schedule.
	SquaredcosCapV2,
	/// Pre-trained betas.
	TrainedBetas(Array1<f32>)
}

/// The type of output a diffusion model was trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPredictionType {
	/// The model predicts the noise of the diffusion process. Stable Diffusion v1 models are
	/// epsilon-prediction models.
	Epsilon,
	/// The model directly predicts the denoised sample.
	Sample,
	/// The model predicts 'v' - see section 2.4 of [Imagen Video](https://imagen.research.google/video/paper.pdf).
	VPrediction
}

/// The output returned by a scheduler's `step` function.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the
	/// next model input in the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	/// `pred_original_sample` can be used to preview progress or for guidance.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}
}

/// A scheduler to be used in diffusion pipelines.
#[allow(clippy::len_without_is_empty)]
pub trait DiffusionScheduler: Clone {
	/// Scales the denoising model input to match the scheduler's expected variance; for the
	/// k-schedulers this is `(sigma**2 + 1) ** 0.5`.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32>;

	/// Sets the number of inference steps. This must be called before `step` to properly compute
	/// the sigmas and timesteps, and resets any multistep state held from a previous run.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Predict the sample at the previous timestep by reversing the SDE. Core function to propagate
	/// the diffusion process from the learned model outputs (most often the predicted noise).
	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput;

	/// Adds noise to the given samples, at the noise level of the given timestep. This is how
	/// image-to-image generation seeds the denoising loop with the conditioning image.
	fn add_noise(&mut self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32>;

	/// Returns the computed scheduler timesteps, in denoising order.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f32;

	/// Returns the number of train timesteps.
	fn len(&self) -> usize;
}

/// Schedulers implementing this trait provide a constructor preconfigured for the noise schedule
/// Stable Diffusion v1 models were trained with (scaled-linear betas, 0.00085 to 0.012, over 1000
/// train timesteps).
pub trait SchedulerOptimizedDefaults {
	/// Constructs the scheduler with defaults optimized for Stable Diffusion v1 models.
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized;
}

/// Builds the beta sequence for a scheduler, validating the range first.
///
/// # Errors
/// Can error if:
/// - `num_train_timesteps` is 0
/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
/// - `beta_end` is less than or equal to `beta_start`
pub(crate) fn build_betas(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Array1<f32>> {
	if num_train_timesteps == 0 {
		anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >0");
	}
	if !beta_start.is_normal() || !beta_end.is_normal() {
		anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
	}
	if beta_start >= beta_end {
		anyhow::bail!("beta_start must be < beta_end");
	}

	Ok(match beta_schedule {
		BetaSchedule::TrainedBetas(betas) => betas.clone(),
		BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
		BetaSchedule::ScaledLinear => {
			let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
			betas.par_map_inplace(|f| *f = f.powi(2));
			betas
		}
		BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(num_train_timesteps, 0.999)
	})
}

/// Creates a beta schedule that discretizes the given `alpha_t_bar` function, which defines the
/// cumulative product of `1 - beta` over time from `t = [0, 1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f32) -> Array1<f32> {
	let alpha_bar = |time_step: f32| ((time_step + 0.008) / 1.008 * std::f32::consts::FRAC_PI_2).cos().powi(2);
	Array1::from_iter((0..num_diffusion_timesteps).map(|i| {
		let t1 = i as f32 / num_diffusion_timesteps as f32;
		let t2 = (i + 1) as f32 / num_diffusion_timesteps as f32;
		(1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
	}))
}

/// The cumulative product of `1 - beta` at each train timestep.
pub(crate) fn alphas_cumprod(betas: &Array1<f32>) -> Array1<f32> {
	betas
		.view()
		.into_iter()
		.scan(1.0, |prod, beta| {
			*prod *= 1.0 - *beta;
			Some(*prod)
		})
		.collect::<Array1<_>>()
}

/// Converts cumulative alpha products into the k-diffusion sigma parameterization,
/// `sqrt((1 - ᾱ) / ᾱ)`, in train-timestep order.
pub(crate) fn sigmas_from_alphas_cumprod(alphas_cumprod: &Array1<f32>) -> Array1<f32> {
	let mut sigmas = alphas_cumprod.clone();
	sigmas.par_map_inplace(|f| {
		*f = ((1.0 - *f) / *f).sqrt();
	});
	sigmas
}

/// The full-range initial noise sigma, `max(sigmas)`.
pub(crate) fn init_noise_sigma_from(sigmas: &Array1<f32>) -> f32 {
	sigmas.iter().fold(0.0_f32, |a, &b| a.max(b))
}

/// Linearly interpolates the per-train-timestep `sigmas` at each (fractional) inference timestep,
/// appending the terminal zero sigma. `timesteps` are positions on the integer grid
/// `0..sigmas.len()`, in denoising (descending) order.
pub(crate) fn interpolate_sigmas(timesteps: ArrayView1<'_, f32>, sigmas: &Array1<f32>) -> Array1<f32> {
	let n = timesteps.len();
	let mut interpolated = Array1::zeros(n + 1);
	for (i, t) in timesteps.iter().enumerate() {
		let lo = (t.floor() as usize).min(sigmas.len() - 2);
		interpolated[i] = sigmas[lo] + (sigmas[lo + 1] - sigmas[lo]) * (t - lo as f32);
	}
	interpolated[n] = 0.0;
	interpolated
}

/// Reverses a full-range sigma sequence and appends the terminal zero, giving the sigma sequence
/// used before `set_timesteps` is called.
pub(crate) fn full_range_sigmas(sigmas: &Array1<f32>) -> Array1<f32> {
	concatenate![Axis(0), sigmas.slice(s![..;-1]), Array1::zeros(1,)]
}

#[cfg(test)]
mod tests {
	use ndarray::Array1;

	use super::*;

	#[test]
	fn betas_are_monotonic() {
		let betas = build_betas(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear).unwrap();
		assert_eq!(betas.len(), 1000);
		assert!(betas.windows(2).into_iter().all(|w| w[0] < w[1]));
		assert!((betas[0] - 0.00085).abs() < 1e-6);
		assert!((betas[999] - 0.012).abs() < 1e-6);
	}

	#[test]
	fn build_betas_rejects_degenerate_ranges() {
		assert!(build_betas(0, 0.0001, 0.02, &BetaSchedule::Linear).is_err());
		assert!(build_betas(1000, 0.02, 0.0001, &BetaSchedule::Linear).is_err());
		assert!(build_betas(1000, f32::NAN, 0.02, &BetaSchedule::Linear).is_err());
	}

	#[test]
	fn interpolation_hits_grid_points_exactly() {
		let sigmas = Array1::from_vec(vec![1.0, 2.0, 4.0, 8.0]);
		let timesteps = Array1::from_vec(vec![3.0, 1.5, 0.0]);
		let interpolated = interpolate_sigmas(timesteps.view(), &sigmas);
		assert_eq!(interpolated.to_vec(), vec![8.0, 3.0, 1.0, 0.0]);
	}
}
