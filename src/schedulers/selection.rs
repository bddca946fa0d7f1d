use std::fmt;
use std::str::FromStr;

use ndarray::{Array4, ArrayView1, ArrayView4};
use rand::Rng;

use super::{
	DDIMScheduler, DiffusionScheduler, DPMSolverMultistepScheduler, EulerAncestralDiscreteScheduler, EulerDiscreteScheduler, LMSDiscreteScheduler,
	PNDMScheduler, SchedulerOptimizedDefaults, SchedulerStepOutput, UniPCMultistepScheduler
};

/// The closed set of schedulers selectable through the prediction surface.
///
/// The string form of each kind (via [`fmt::Display`] and [`FromStr`]) matches the name the
/// prediction API accepts, so an invalid scheduler name fails at parse time rather than inside
/// inference.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
	/// DPM-Solver++ in multistep form; see [`DPMSolverMultistepScheduler`].
	#[default]
	DpmSolverMultistep,
	/// UniPC predictor-corrector; see [`UniPCMultistepScheduler`].
	UniPcMultistep,
	/// Denoising diffusion implicit models; see [`DDIMScheduler`].
	Ddim,
	/// Karras et al. Euler method; see [`EulerDiscreteScheduler`].
	KEuler,
	/// Karras et al. ancestral Euler method; see [`EulerAncestralDiscreteScheduler`].
	KEulerAncestral,
	/// Pseudo linear multistep; see [`PNDMScheduler`].
	Pndm,
	/// Karras et al. linear multistep; see [`LMSDiscreteScheduler`].
	Klms
}

impl SchedulerKind {
	/// All seven selectable scheduler kinds.
	pub const ALL: [SchedulerKind; 7] = [
		SchedulerKind::DpmSolverMultistep,
		SchedulerKind::UniPcMultistep,
		SchedulerKind::Ddim,
		SchedulerKind::KEuler,
		SchedulerKind::KEulerAncestral,
		SchedulerKind::Pndm,
		SchedulerKind::Klms
	];

	/// The name of this scheduler kind on the prediction surface.
	pub fn as_str(&self) -> &'static str {
		match self {
			SchedulerKind::DpmSolverMultistep => "DPMSolverMultistep",
			SchedulerKind::UniPcMultistep => "UniPCMultistepScheduler",
			SchedulerKind::Ddim => "DDIM",
			SchedulerKind::KEuler => "K_EULER",
			SchedulerKind::KEulerAncestral => "K_EULER_ANCESTRAL",
			SchedulerKind::Pndm => "PNDM",
			SchedulerKind::Klms => "KLMS"
		}
	}

	/// Constructs the concrete scheduler for this kind, configured with the Stable Diffusion v1
	/// optimized defaults.
	pub fn scheduler(&self) -> anyhow::Result<Scheduler> {
		Ok(match self {
			SchedulerKind::DpmSolverMultistep => Scheduler::DpmSolverMultistep(DPMSolverMultistepScheduler::stable_diffusion_v1_optimized_default()?),
			SchedulerKind::UniPcMultistep => Scheduler::UniPcMultistep(UniPCMultistepScheduler::stable_diffusion_v1_optimized_default()?),
			SchedulerKind::Ddim => Scheduler::Ddim(DDIMScheduler::stable_diffusion_v1_optimized_default()?),
			SchedulerKind::KEuler => Scheduler::KEuler(EulerDiscreteScheduler::stable_diffusion_v1_optimized_default()?),
			SchedulerKind::KEulerAncestral => Scheduler::KEulerAncestral(EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default()?),
			SchedulerKind::Pndm => Scheduler::Pndm(PNDMScheduler::stable_diffusion_v1_optimized_default()?),
			SchedulerKind::Klms => Scheduler::Klms(LMSDiscreteScheduler::stable_diffusion_v1_optimized_default()?)
		})
	}
}

impl fmt::Display for SchedulerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SchedulerKind {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SchedulerKind::ALL
			.iter()
			.find(|kind| kind.as_str() == s)
			.copied()
			.ok_or_else(|| anyhow::anyhow!("unknown scheduler `{s}`; expected one of: DPMSolverMultistep, UniPCMultistepScheduler, DDIM, K_EULER, K_EULER_ANCESTRAL, PNDM, KLMS"))
	}
}

/// A constructed scheduler of any selectable kind, dispatching [`DiffusionScheduler`] to the
/// underlying implementation by exhaustive match.
#[derive(Clone)]
#[allow(missing_docs)]
pub enum Scheduler {
	DpmSolverMultistep(DPMSolverMultistepScheduler),
	UniPcMultistep(UniPCMultistepScheduler),
	Ddim(DDIMScheduler),
	KEuler(EulerDiscreteScheduler),
	KEulerAncestral(EulerAncestralDiscreteScheduler),
	Pndm(PNDMScheduler),
	Klms(LMSDiscreteScheduler)
}

macro_rules! delegate {
	($self:expr, $inner:ident => $body:expr) => {
		match $self {
			Scheduler::DpmSolverMultistep($inner) => $body,
			Scheduler::UniPcMultistep($inner) => $body,
			Scheduler::Ddim($inner) => $body,
			Scheduler::KEuler($inner) => $body,
			Scheduler::KEulerAncestral($inner) => $body,
			Scheduler::Pndm($inner) => $body,
			Scheduler::Klms($inner) => $body
		}
	};
}

impl Scheduler {
	/// The kind of this scheduler.
	pub fn kind(&self) -> SchedulerKind {
		match self {
			Scheduler::DpmSolverMultistep(_) => SchedulerKind::DpmSolverMultistep,
			Scheduler::UniPcMultistep(_) => SchedulerKind::UniPcMultistep,
			Scheduler::Ddim(_) => SchedulerKind::Ddim,
			Scheduler::KEuler(_) => SchedulerKind::KEuler,
			Scheduler::KEulerAncestral(_) => SchedulerKind::KEulerAncestral,
			Scheduler::Pndm(_) => SchedulerKind::Pndm,
			Scheduler::Klms(_) => SchedulerKind::Klms
		}
	}
}

impl DiffusionScheduler for Scheduler {
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		delegate!(self, s => s.scale_model_input(sample, timestep))
	}

	fn set_timesteps(&mut self, num_inference_steps: usize) {
		delegate!(self, s => s.set_timesteps(num_inference_steps))
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput {
		delegate!(self, s => s.step(model_output, timestep, sample, rng))
	}

	fn add_noise(&mut self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		delegate!(self, s => s.add_noise(original_samples, noise, timestep))
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		delegate!(self, s => s.timesteps())
	}

	fn init_noise_sigma(&self) -> f32 {
		delegate!(self, s => s.init_noise_sigma())
	}

	fn len(&self) -> usize {
		delegate!(self, s => s.len())
	}
}

#[cfg(test)]
mod tests {
	use super::SchedulerKind;

	#[test]
	fn names_round_trip() {
		for kind in SchedulerKind::ALL {
			assert_eq!(kind.as_str().parse::<SchedulerKind>().unwrap(), kind);
		}
	}

	#[test]
	fn unknown_names_are_rejected() {
		assert!("DDIMScheduler".parse::<SchedulerKind>().is_err());
		assert!("".parse::<SchedulerKind>().is_err());
	}

	#[test]
	fn every_kind_constructs() {
		for kind in SchedulerKind::ALL {
			let scheduler = kind.scheduler().unwrap();
			assert_eq!(scheduler.kind(), kind);
		}
	}
}
