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

use anyhow::Context;
use ndarray::{Array1, Array4, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use super::{
	alphas_cumprod, build_betas, full_range_sigmas, init_noise_sigma_from, interpolate_sigmas, sigmas_from_alphas_cumprod, BetaSchedule, DiffusionScheduler,
	SchedulerOptimizedDefaults, SchedulerStepOutput
};

/// Euler scheduler (Algorithm 2) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Clone)]
pub struct EulerDiscreteScheduler {
	alphas_cumprod: Array1<f32>,
	sigmas: Array1<f32>,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	num_inference_steps: Option<usize>,
	has_scale_input_been_called: bool
}

impl Default for EulerDiscreteScheduler {
	fn default() -> Self {
		Self::new(1000, 0.0001, 0.02, &BetaSchedule::Linear).unwrap()
	}
}

impl EulerDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule, a mapping from a beta range to a sequence of betas
	///   for stepping the model; see [`BetaSchedule`]
	///
	/// # Errors
	/// Errors if the train timestep count or beta range is degenerate: a zero train
	/// timestep count, a non-normal or inverted beta range.
	pub fn new(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Self> {
		let betas = build_betas(num_train_timesteps, beta_start, beta_end, beta_schedule)?;
		let alphas_cumprod = alphas_cumprod(&betas);

		let sigmas = full_range_sigmas(&sigmas_from_alphas_cumprod(&alphas_cumprod));
		let init_noise_sigma = init_noise_sigma_from(&sigmas);

		let timesteps = Array1::linspace(num_train_timesteps as f32 - 1.0, 0.0, num_train_timesteps);

		Ok(Self {
			alphas_cumprod,
			sigmas,
			init_noise_sigma,
			timesteps,
			num_inference_steps: None,
			num_train_timesteps,
			has_scale_input_been_called: false
		})
	}

	fn step_index(&self, timestep: f32) -> usize {
		self.timesteps
			.iter()
			.position(|&p| p == timestep)
			.with_context(|| format!("timestep out of this scheduler's bounds: {timestep}"))
			.unwrap()
	}
}

impl DiffusionScheduler for EulerDiscreteScheduler {
	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the K-LMS algorithm.
	///
	/// # Panics
	/// Panics if the given `timestep` is out of this scheduler's bounds (see `num_train_timesteps`).
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		let sigma = self.sigmas[self.step_index(timestep)];
		self.has_scale_input_been_called = true;
		&sample / (sigma.powi(2) + 1.0).sqrt()
	}

	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.num_inference_steps = Some(num_inference_steps);

		let timesteps = Array1::linspace(self.num_train_timesteps as f32 - 1.0, 0.0, num_inference_steps);
		let sigmas = sigmas_from_alphas_cumprod(&self.alphas_cumprod);

		self.sigmas = interpolate_sigmas(timesteps.view(), &sigmas);
		self.timesteps = timesteps;
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput {
		let s_churn = 0.0_f32;
		let s_tmin = 0.0_f32;
		let s_tmax = f32::INFINITY;
		let s_noise = 1.0_f32;

		assert!(self.has_scale_input_been_called);

		let step_index = self.step_index(timestep);
		let sigma = self.sigmas[step_index];

		let gamma = if s_tmin <= sigma && sigma <= s_tmax {
			(s_churn / (self.sigmas.len() as f32 - 1.0)).min(2.0_f32.sqrt() - 1.0)
		} else {
			0.0
		};
		let sigma_hat = sigma * (gamma + 1.0);
		let sample = if gamma > 0.0 {
			let eps = Array4::<f32>::random_using(model_output.raw_dim(), StandardNormal, rng) * s_noise;
			sample.to_owned() + eps * sigma_hat.mul_add(sigma_hat, -sigma.powi(2)).sqrt()
		} else {
			sample.to_owned()
		};

		let pred_original_sample = &sample - sigma_hat * &model_output;

		let derivative = (&sample - &pred_original_sample) / sigma_hat;
		let dt = self.sigmas[step_index + 1] - sigma_hat;
		let prev_sample = sample + derivative * dt;

		SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		}
	}

	fn add_noise(&mut self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		let sigma = self.sigmas[self.step_index(timestep)];
		&original_samples + &noise * sigma
	}

	fn timesteps(&self) -> ndarray::ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.init_noise_sigma
	}

	fn len(&self) -> usize {
		self.num_train_timesteps
	}
}

impl SchedulerOptimizedDefaults for EulerDiscreteScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear)
	}
}
