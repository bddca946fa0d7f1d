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

use super::{alphas_cumprod, build_betas, BetaSchedule, DiffusionScheduler, SchedulerOptimizedDefaults, SchedulerPredictionType, SchedulerStepOutput};

/// The B(h) function of the UniPC framework.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub enum UniPCVariant {
	/// `B(h) = h`.
	Bh1,
	/// `B(h) = expm1(h)`. Recommended for guided sampling.
	#[default]
	Bh2
}

/// Additional configuration for the [`UniPCMultistepScheduler`].
#[derive(Debug, Clone)]
pub struct UniPCMultistepSchedulerConfig {
	/// The order of the corrector (and of the predictor at convergence); can be `1`, `2`, or `3`.
	/// We recommend `solver_order: 2` for guided sampling.
	pub solver_order: usize,
	/// The B(h) function; see [`UniPCVariant`].
	pub variant: UniPCVariant,
	/// Whether to use lower-order solvers in the final steps, stabilizing few-step sampling.
	pub lower_order_final: bool
}

impl Default for UniPCMultistepSchedulerConfig {
	fn default() -> Self {
		Self {
			solver_order: 2,
			variant: UniPCVariant::Bh2,
			lower_order_final: true
		}
	}
}

/// [UniPC][unipc] is a unified predictor-corrector framework for fast sampling of diffusion
/// models: each step first corrects the previous sample with the freshly available model output,
/// then predicts the next sample, reusing a history of data predictions like
/// [DPM-Solver++](super::DPMSolverMultistepScheduler).
///
/// [unipc]: https://arxiv.org/abs/2302.04867
#[derive(Clone)]
pub struct UniPCMultistepScheduler {
	alphas_cumprod: Array1<f32>,
	alpha_t: Array1<f32>,
	sigma_t: Array1<f32>,
	lambda_t: Array1<f32>,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	num_inference_steps: Option<usize>,
	config: UniPCMultistepSchedulerConfig,
	prediction_type: SchedulerPredictionType,
	model_outputs: Vec<Option<Array4<f32>>>,
	timestep_list: Vec<Option<usize>>,
	lower_order_nums: usize,
	last_sample: Option<Array4<f32>>,
	this_order: usize
}

impl Default for UniPCMultistepScheduler {
	fn default() -> Self {
		Self::new(1000, 0.0001, 0.02, &BetaSchedule::Linear, &SchedulerPredictionType::Epsilon, None).unwrap()
	}
}

impl UniPCMultistepScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule, a mapping from a beta range to a sequence of betas
	///   for stepping the model; see [`BetaSchedule`]
	/// - **`prediction_type`**: the output prediction type; see [`SchedulerPredictionType`]
	///
	/// # Errors
	/// Errors if the train timestep count or beta range is degenerate (a zero train
	/// timestep count, a non-normal or inverted beta range), or if `solver_order` is not 1, 2, or 3.
	pub fn new(
		num_train_timesteps: usize,
		beta_start: f32,
		beta_end: f32,
		beta_schedule: &BetaSchedule,
		prediction_type: &SchedulerPredictionType,
		config: Option<UniPCMultistepSchedulerConfig>
	) -> anyhow::Result<Self> {
		let config = config.unwrap_or_default();
		if !(1..=3).contains(&config.solver_order) {
			anyhow::bail!("solver_order ({}) must be 1, 2, or 3", config.solver_order);
		}

		let betas = build_betas(num_train_timesteps, beta_start, beta_end, beta_schedule)?;
		let alphas_cumprod = alphas_cumprod(&betas);

		let alpha_t = alphas_cumprod.map(|f| f.sqrt());
		let sigma_t = alphas_cumprod.map(|f| (1.0 - f).sqrt());
		let lambda_t = alpha_t.map(|f| f.ln()) - sigma_t.map(|f| f.ln());

		let timesteps = Array1::linspace(num_train_timesteps as f32 - 1.0, 0.0, num_train_timesteps).map(|f| f.round());

		Ok(Self {
			alphas_cumprod,
			alpha_t,
			sigma_t,
			lambda_t,
			init_noise_sigma: 1.0,
			timesteps,
			num_inference_steps: None,
			num_train_timesteps,
			prediction_type: *prediction_type,
			model_outputs: vec![None; config.solver_order],
			timestep_list: vec![None; config.solver_order],
			lower_order_nums: 0,
			last_sample: None,
			this_order: config.solver_order,
			config
		})
	}

	/// Converts the model output to the data prediction (`x_0`) the UniPC updates integrate.
	fn convert_model_output(&self, model_output: ArrayView4<'_, f32>, timestep: usize, sample: ArrayView4<'_, f32>) -> Array4<f32> {
		let (alpha_t, sigma_t) = (self.alpha_t[timestep], self.sigma_t[timestep]);
		match self.prediction_type {
			SchedulerPredictionType::Epsilon => (&sample - sigma_t * &model_output) / alpha_t,
			SchedulerPredictionType::Sample => model_output.to_owned(),
			SchedulerPredictionType::VPrediction => alpha_t * &sample - sigma_t * &model_output
		}
	}

	/// The shared UniP/UniC setup: timestep ratios `r_k`, scaled differences `D1_k`, the Taylor
	/// coefficient vector `b`, and the step size `h` between λ(s0) and λ(t).
	#[allow(clippy::type_complexity)]
	fn update_coefficients(&self, t: usize, order: usize) -> (Vec<f32>, Vec<Array4<f32>>, Vec<f32>, f32) {
		let s0 = self.timestep_list[self.timestep_list.len() - 1].unwrap();
		let m0 = self.model_outputs[self.model_outputs.len() - 1].as_ref().unwrap();
		let h = self.lambda_t[t] - self.lambda_t[s0];

		let mut rks = Vec::with_capacity(order);
		let mut d1s = Vec::with_capacity(order - 1);
		for i in 1..order {
			let si = self.timestep_list[self.timestep_list.len() - 1 - i].unwrap();
			let mi = self.model_outputs[self.model_outputs.len() - 1 - i].as_ref().unwrap();
			let rk = (self.lambda_t[si] - self.lambda_t[s0]) / h;
			rks.push(rk);
			d1s.push((mi - m0) / rk);
		}
		rks.push(1.0);

		// data prediction integrates exp(-λ), so the expansion is in hh = -h
		let hh = -h;
		let h_phi_1 = hh.exp_m1();
		let b_h = match self.config.variant {
			UniPCVariant::Bh1 => hh,
			UniPCVariant::Bh2 => hh.exp_m1()
		};

		let mut b = Vec::with_capacity(order);
		let mut h_phi_k = h_phi_1 / hh - 1.0;
		let mut factorial_i = 1.0_f32;
		for i in 1..=order {
			b.push(h_phi_k * factorial_i / b_h);
			factorial_i *= (i + 1) as f32;
			h_phi_k = h_phi_k / hh - 1.0 / factorial_i;
		}

		(rks, d1s, b, h)
	}

	/// The UniP update: predicts the sample at `prev_timestep` from the model-output history.
	fn unified_predictor_update(&self, sample: ArrayView4<'_, f32>, prev_timestep: usize, order: usize) -> Array4<f32> {
		let s0 = self.timestep_list[self.timestep_list.len() - 1].unwrap();
		let m0 = self.model_outputs[self.model_outputs.len() - 1].as_ref().unwrap();
		let (rks, d1s, b, h) = self.update_coefficients(prev_timestep, order);

		let (alpha_t, sigma_t, sigma_s0) = (self.alpha_t[prev_timestep], self.sigma_t[prev_timestep], self.sigma_t[s0]);
		let h_phi_1 = (-h).exp_m1();
		let b_h = match self.config.variant {
			UniPCVariant::Bh1 => -h,
			UniPCVariant::Bh2 => (-h).exp_m1()
		};

		let x_t_ = (sigma_t / sigma_s0) * &sample - (alpha_t * h_phi_1) * m0;
		if d1s.is_empty() {
			return x_t_;
		}

		// for the predictor, the last Taylor row is dropped, leaving an (order-1)-unknown system;
		// at order 2 this collapses to the closed-form coefficient 1/2
		let rhos_p = if order == 2 {
			vec![0.5]
		} else {
			solve_lower_system(&rks[..order - 1], &b[..order - 1])
		};

		let mut pred_res: Array4<f32> = Array4::zeros(m0.raw_dim());
		for (rho, d1) in rhos_p.iter().zip(d1s.iter()) {
			pred_res = pred_res + *rho * d1;
		}
		x_t_ - (alpha_t * b_h) * pred_res
	}

	/// The UniC update: corrects the current sample using the model output evaluated at it.
	fn unified_corrector_update(
		&self,
		this_model_output: &Array4<f32>,
		this_timestep: usize,
		last_sample: &Array4<f32>,
		order: usize
	) -> Array4<f32> {
		let s0 = self.timestep_list[self.timestep_list.len() - 1].unwrap();
		let m0 = self.model_outputs[self.model_outputs.len() - 1].as_ref().unwrap();
		let (rks, d1s, b, h) = self.update_coefficients(this_timestep, order);

		let (alpha_t, sigma_t, sigma_s0) = (self.alpha_t[this_timestep], self.sigma_t[this_timestep], self.sigma_t[s0]);
		let h_phi_1 = (-h).exp_m1();
		let b_h = match self.config.variant {
			UniPCVariant::Bh1 => -h,
			UniPCVariant::Bh2 => (-h).exp_m1()
		};

		let rhos_c = if order == 1 { vec![0.5] } else { solve_lower_system(&rks, &b) };

		let x_t_ = (sigma_t / sigma_s0) * last_sample - (alpha_t * h_phi_1) * m0;
		let d1_t = this_model_output - m0;

		let mut corr_res: Array4<f32> = Array4::zeros(m0.raw_dim());
		for (rho, d1) in rhos_c.iter().zip(d1s.iter()) {
			corr_res = corr_res + *rho * d1;
		}
		x_t_ - (alpha_t * b_h) * (corr_res + rhos_c[rhos_c.len() - 1] * d1_t)
	}
}

/// Solves the Vandermonde-structured system `R x = b` with `R[i][k] = rks[k]^i`, by Gaussian
/// elimination with partial pivoting. The system is at most 3x3.
fn solve_lower_system(rks: &[f32], b: &[f32]) -> Vec<f32> {
	let n = b.len();
	let mut m = vec![vec![0.0_f32; n + 1]; n];
	for (i, row) in m.iter_mut().enumerate() {
		for k in 0..n {
			row[k] = rks[k].powi(i as i32);
		}
		row[n] = b[i];
	}

	for col in 0..n {
		let pivot = (col..n).max_by(|&a, &b| m[a][col].abs().partial_cmp(&m[b][col].abs()).unwrap()).unwrap();
		m.swap(col, pivot);
		for row in col + 1..n {
			let factor = m[row][col] / m[col][col];
			for k in col..=n {
				m[row][k] -= factor * m[col][k];
			}
		}
	}

	let mut x = vec![0.0_f32; n];
	for row in (0..n).rev() {
		let mut acc = m[row][n];
		for k in row + 1..n {
			acc -= m[row][k] * x[k];
		}
		x[row] = acc / m[row][row];
	}
	x
}

impl DiffusionScheduler for UniPCMultistepScheduler {
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, _: f32) -> Array4<f32> {
		sample.to_owned()
	}

	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.num_inference_steps = Some(num_inference_steps);
		self.timesteps = Array1::linspace(self.num_train_timesteps as f32 - 1.0, 0.0, num_inference_steps).map(|f| f.round());
		self.model_outputs = vec![None; self.config.solver_order];
		self.timestep_list = vec![None; self.config.solver_order];
		self.lower_order_nums = 0;
		self.last_sample = None;
		self.this_order = self.config.solver_order;
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, _: &mut R) -> SchedulerStepOutput {
		let step_index = self
			.timesteps
			.iter()
			.position(|&p| p == timestep)
			.with_context(|| format!("timestep out of this scheduler's bounds: {timestep}"))
			.unwrap();
		let timestep = timestep as usize;

		let model_output_convert = self.convert_model_output(model_output, timestep, sample);

		// correct the sample produced by the previous step's predictor, now that the model has been
		// evaluated at it
		let sample = if step_index > 0 && self.last_sample.is_some() {
			let last_sample = self.last_sample.take().unwrap();
			self.unified_corrector_update(&model_output_convert, timestep, &last_sample, self.this_order)
		} else {
			sample.to_owned()
		};

		for i in 0..self.config.solver_order - 1 {
			self.model_outputs[i] = self.model_outputs[i + 1].take();
			self.timestep_list[i] = self.timestep_list[i + 1].take();
		}
		let m_len = self.model_outputs.len();
		self.model_outputs[m_len - 1] = Some(model_output_convert);
		self.timestep_list[m_len - 1] = Some(timestep);

		let prev_timestep = if step_index == self.timesteps.len() - 1 {
			0
		} else {
			self.timesteps[step_index + 1] as usize
		};

		let mut this_order = self.config.solver_order;
		if self.config.lower_order_final {
			this_order = this_order.min(self.timesteps.len() - step_index);
		}
		self.this_order = this_order.min(self.lower_order_nums + 1);

		let prev_sample = self.unified_predictor_update(sample.view(), prev_timestep, self.this_order);

		if self.lower_order_nums < self.config.solver_order {
			self.lower_order_nums += 1;
		}
		self.last_sample = Some(sample);

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

impl SchedulerOptimizedDefaults for UniPCMultistepScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear, &SchedulerPredictionType::Epsilon, Some(UniPCMultistepSchedulerConfig::default()))
	}
}

#[cfg(test)]
mod tests {
	use super::solve_lower_system;

	#[test]
	fn solves_small_systems() {
		// R = [[1, 1], [0.5, 1]], b = [1.5, 1.25] -> x = [0.5, 1.0]
		let x = solve_lower_system(&[0.5, 1.0], &[1.5, 1.25]);
		assert!((x[0] - 0.5).abs() < 1e-5);
		assert!((x[1] - 1.0).abs() < 1e-5);
	}
}
