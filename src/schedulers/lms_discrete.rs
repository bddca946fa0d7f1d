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
use rand::Rng;

use super::{
	alphas_cumprod, build_betas, full_range_sigmas, init_noise_sigma_from, interpolate_sigmas, sigmas_from_alphas_cumprod, BetaSchedule, DiffusionScheduler,
	SchedulerOptimizedDefaults, SchedulerStepOutput
};

/// [Linear multistep][lm] scheduler for discrete beta schedules. Based on the [original
/// `k-diffusion` implementation][kdif] by Katherine Crowson.
///
/// [lm]: https://en.wikipedia.org/wiki/Linear_multistep_method#Adams%E2%80%93Bashforth_methods
/// [kdif]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L181
#[derive(Clone)]
pub struct LMSDiscreteScheduler {
	alphas_cumprod: Array1<f32>,
	sigmas: Array1<f32>,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	num_inference_steps: Option<usize>,
	has_scale_input_been_called: bool,
	derivatives: Vec<Array4<f32>>
}

impl Default for LMSDiscreteScheduler {
	fn default() -> Self {
		Self::new(1000, 0.0001, 0.02, &BetaSchedule::Linear).unwrap()
	}
}

impl LMSDiscreteScheduler {
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
			has_scale_input_been_called: false,
			derivatives: vec![]
		})
	}

	fn step_index(&self, timestep: f32) -> usize {
		self.timesteps
			.iter()
			.position(|&p| p == timestep)
			.with_context(|| format!("timestep out of this scheduler's bounds: {timestep}"))
			.unwrap()
	}

	/// Computes the linear multistep coefficient for derivative `current_order` at step `t`: the
	/// integral of the Lagrange basis polynomial over `[sigmas[t], sigmas[t + 1]]`.
	///
	/// The basis polynomial has degree `order - 1 <= 3`, so a single Simpson's rule interval
	/// evaluates the integral exactly.
	fn lms_coefficient(&self, order: usize, t: usize, current_order: usize) -> f32 {
		assert!(t + 1 >= order);

		let lms_derivative = |tau: f64| -> f64 {
			let mut prod = 1.0_f64;
			for k in 0..order {
				if k == current_order {
					continue;
				}
				prod *= (tau - f64::from(self.sigmas[t - k])) / f64::from(self.sigmas[t - current_order] - self.sigmas[t - k]);
			}
			prod
		};

		let (a, b) = (f64::from(self.sigmas[t]), f64::from(self.sigmas[t + 1]));
		((b - a) / 6.0 * (lms_derivative(a) + 4.0 * lms_derivative((a + b) / 2.0) + lms_derivative(b))) as f32
	}
}

impl DiffusionScheduler for LMSDiscreteScheduler {
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
		self.derivatives = Vec::new();
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, _rng: &mut R) -> SchedulerStepOutput {
		assert!(self.has_scale_input_been_called);

		let order = 4;

		let step_index = self.step_index(timestep);
		let sigma = self.sigmas[step_index];

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = &sample - sigma * &model_output;

		// 2. convert to an ODE derivative
		let derivative = (&sample - &pred_original_sample) / sigma;
		self.derivatives.push(derivative);
		if self.derivatives.len() > order {
			self.derivatives.remove(0);
		}

		// 3. compute linear multistep coefficients
		let order = order.min(step_index + 1);
		let lms_coeffs: Vec<_> = (0..order).map(|o| self.lms_coefficient(order, step_index, o)).collect();

		// 4. compute previous sample based on the derivatives path
		let mut prev_sample = sample.to_owned();
		for (coeff, derivative) in lms_coeffs.iter().zip(self.derivatives.iter().rev()) {
			prev_sample = prev_sample + derivative * *coeff;
		}

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

impl SchedulerOptimizedDefaults for LMSDiscreteScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear)
	}
}
