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

use ndarray::{Array1, Array4, ArrayView4};
use rand::Rng;

use super::{alphas_cumprod, build_betas, BetaSchedule, DiffusionScheduler, SchedulerOptimizedDefaults, SchedulerStepOutput};

/// [Pseudo numerical methods for diffusion models][pndm] (PNDM) in its pseudo linear multistep
/// (PLMS) form, the variant Stable Diffusion uses: the Runge-Kutta warmup steps are skipped and the
/// first steps are instead taken with lower-order Adams-Bashforth updates.
///
/// The scheduler keeps a history of up to 4 noise predictions (`ets`) and combines them with the
/// standard Adams-Bashforth coefficients once the history is full.
///
/// [pndm]: https://arxiv.org/abs/2202.09778
#[derive(Clone)]
pub struct PNDMScheduler {
	alphas_cumprod: Array1<f32>,
	final_alpha_cumprod: f32,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	num_inference_steps: Option<usize>,
	steps_offset: usize,
	counter: usize,
	cur_sample: Option<Array4<f32>>,
	ets: Vec<Array4<f32>>
}

impl Default for PNDMScheduler {
	fn default() -> Self {
		Self::new(1000, 0.0001, 0.02, &BetaSchedule::Linear).unwrap()
	}
}

impl PNDMScheduler {
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
		let final_alpha_cumprod = alphas_cumprod[0];

		let timesteps = Array1::linspace(num_train_timesteps as f32 - 1.0, 0.0, num_train_timesteps);

		Ok(Self {
			alphas_cumprod,
			final_alpha_cumprod,
			init_noise_sigma: 1.0,
			timesteps,
			num_inference_steps: None,
			num_train_timesteps,
			steps_offset: 1,
			counter: 0,
			cur_sample: None,
			ets: vec![]
		})
	}

	/// See formula (9) of the PNDM paper: the transfer function φ(x_t, ε_t, t, t−δ).
	fn get_prev_sample(&self, sample: ArrayView4<'_, f32>, timestep: usize, prev_timestep: isize, model_output: &Array4<f32>) -> Array4<f32> {
		let alpha_prod_t = self.alphas_cumprod[timestep];
		let alpha_prod_t_prev = if prev_timestep >= 0 {
			self.alphas_cumprod[prev_timestep as usize]
		} else {
			self.final_alpha_cumprod
		};
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();

		// the full formula is (α_prev - α) / (denominator), with the denominator chosen so the
		// update is exact when the model is; see the paper for the derivation
		let model_output_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt() + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

		sample_coeff * &sample - ((alpha_prod_t_prev - alpha_prod_t) / model_output_denom_coeff) * model_output
	}
}

impl DiffusionScheduler for PNDMScheduler {
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, _: f32) -> Array4<f32> {
		sample.to_owned()
	}

	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.num_inference_steps = Some(num_inference_steps);

		let step_ratio = self.num_train_timesteps / num_inference_steps;
		let base: Vec<usize> = (0..num_inference_steps).map(|i| i * step_ratio + self.steps_offset).collect();

		// PLMS re-runs the penultimate timestep once in place of the Runge-Kutta warmup, so the
		// sequence has one duplicated entry (and one more entry than requested steps)
		let mut plms: Vec<f32> = base.iter().map(|t| *t as f32).collect();
		if let Some(&last) = base.last() {
			if base.len() > 1 {
				plms.pop();
				plms.push(base[base.len() - 2] as f32);
				plms.push(last as f32);
			}
		}
		plms.reverse();

		self.timesteps = Array1::from_vec(plms);
		self.counter = 0;
		self.cur_sample = None;
		self.ets = vec![];
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, _: &mut R) -> SchedulerStepOutput {
		let step_ratio = self.num_train_timesteps / self.num_inference_steps.expect("set_timesteps must be called before step");
		let mut timestep = timestep as usize;
		let mut prev_timestep = timestep as isize - step_ratio as isize;

		if self.counter != 1 {
			if self.ets.len() > 3 {
				self.ets.drain(..self.ets.len() - 3);
			}
			self.ets.push(model_output.to_owned());
		} else {
			// the second step re-evaluates at the first timestep with the averaged prediction
			prev_timestep = timestep as isize;
			timestep += step_ratio;
		}

		let ets_len = self.ets.len();
		let (model_output, sample): (Array4<f32>, Array4<f32>) = if ets_len == 1 && self.counter == 0 {
			self.cur_sample = Some(sample.to_owned());
			(model_output.to_owned(), sample.to_owned())
		} else if ets_len == 1 && self.counter == 1 {
			let sample = self.cur_sample.take().expect("PLMS warmup state lost between steps");
			((&model_output + &self.ets[0]) / 2.0, sample)
		} else if ets_len == 2 {
			((3.0 * &self.ets[1] - &self.ets[0]) / 2.0, sample.to_owned())
		} else if ets_len == 3 {
			((23.0 * &self.ets[2] - 16.0 * &self.ets[1] + 5.0 * &self.ets[0]) / 12.0, sample.to_owned())
		} else {
			(
				(1.0 / 24.0) * (55.0 * &self.ets[3] - 59.0 * &self.ets[2] + 37.0 * &self.ets[1] - 9.0 * &self.ets[0]),
				sample.to_owned()
			)
		};

		let prev_sample = self.get_prev_sample(sample.view(), timestep, prev_timestep, &model_output);
		self.counter += 1;

		SchedulerStepOutput {
			prev_sample,
			pred_original_sample: None
		}
	}

	fn add_noise(&mut self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		let timestep = timestep as usize;
		self.alphas_cumprod[timestep].sqrt() * &original_samples + (1.0 - self.alphas_cumprod[timestep]).sqrt() * &noise
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

impl SchedulerOptimizedDefaults for PNDMScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear)
	}
}
