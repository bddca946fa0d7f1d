use ndarray::Array4;
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use pastiche::schedulers::{DiffusionScheduler, SchedulerKind};
use rand::{rngs::StdRng, SeedableRng};

const LATENT_SHAPE: (usize, usize, usize, usize) = (1, 4, 8, 8);

#[test]
fn timesteps_stay_in_train_range_and_descend() {
	for kind in SchedulerKind::ALL {
		let mut scheduler = kind.scheduler().unwrap();
		scheduler.set_timesteps(25);

		let timesteps = scheduler.timesteps().to_owned();
		assert!(!timesteps.is_empty(), "{kind}");
		assert_eq!(scheduler.len(), 1000, "{kind}");

		for t in timesteps.iter() {
			assert!((0.0..1000.0).contains(t), "{kind}: timestep {t} out of range");
		}
		// PLMS re-runs one warmup timestep, so its sequence is non-increasing rather than
		// strictly decreasing
		for w in timesteps.windows(2) {
			assert!(w[1] <= w[0], "{kind}: timesteps must not ascend");
		}
	}
}

#[test]
fn k_schedulers_report_the_v1_noise_sigma() {
	for kind in [SchedulerKind::KEuler, SchedulerKind::KEulerAncestral, SchedulerKind::Klms] {
		let scheduler = kind.scheduler().unwrap();
		// sqrt((1 - ᾱ_T) / ᾱ_T) for the Stable Diffusion v1 schedule
		assert!((14.0..15.0).contains(&scheduler.init_noise_sigma()), "{kind}");
	}
	for kind in [SchedulerKind::DpmSolverMultistep, SchedulerKind::UniPcMultistep, SchedulerKind::Ddim, SchedulerKind::Pndm] {
		let scheduler = kind.scheduler().unwrap();
		assert_eq!(scheduler.init_noise_sigma(), 1.0, "{kind}");
	}
}

#[test]
fn full_denoising_pass_keeps_shape_and_stays_finite() {
	for kind in SchedulerKind::ALL {
		let mut scheduler = kind.scheduler().unwrap();
		scheduler.set_timesteps(8);

		let mut rng = StdRng::seed_from_u64(7);
		let mut latents = Array4::<f32>::random_using(LATENT_SHAPE, StandardNormal, &mut rng) * scheduler.init_noise_sigma();

		for t in scheduler.timesteps().to_owned().iter() {
			let model_input = scheduler.scale_model_input(latents.view(), *t);
			assert_eq!(model_input.dim(), LATENT_SHAPE, "{kind}");

			// a zero noise prediction is enough to exercise every update path
			let model_output = Array4::<f32>::zeros(LATENT_SHAPE);
			let output = scheduler.step(model_output.view(), *t, latents.view(), &mut rng);
			latents = output.prev_sample().to_owned();

			assert_eq!(latents.dim(), LATENT_SHAPE, "{kind}");
			assert!(latents.iter().all(|f| f.is_finite()), "{kind}: non-finite latents at timestep {t}");
		}
	}
}

#[test]
fn add_noise_is_deterministic_for_a_fixed_rng() {
	for kind in SchedulerKind::ALL {
		let mut scheduler = kind.scheduler().unwrap();
		scheduler.set_timesteps(25);

		let timestep = scheduler.timesteps()[0];
		let sample = Array4::<f32>::zeros(LATENT_SHAPE);
		let noise = Array4::<f32>::random_using(LATENT_SHAPE, StandardNormal, &mut StdRng::seed_from_u64(42));

		let a = scheduler.add_noise(sample.view(), noise.view(), timestep);
		let b = scheduler.add_noise(sample.view(), noise.view(), timestep);
		assert_eq!(a, b, "{kind}");
		assert!(a.iter().all(|f| f.is_finite()), "{kind}");
		// at the noisiest retained timestep, the noised sample must actually carry noise
		assert!(a.iter().any(|f| *f != 0.0), "{kind}");
	}
}

#[test]
fn stochastic_schedulers_are_reproducible_by_seed() {
	let run = |seed: u64| {
		let mut scheduler = SchedulerKind::KEulerAncestral.scheduler().unwrap();
		scheduler.set_timesteps(8);
		let mut rng = StdRng::seed_from_u64(seed);
		let mut latents = Array4::<f32>::random_using(LATENT_SHAPE, StandardNormal, &mut rng) * scheduler.init_noise_sigma();
		for t in scheduler.timesteps().to_owned().iter() {
			let model_input = scheduler.scale_model_input(latents.view(), *t);
			let output = scheduler.step(model_input.view(), *t, latents.view(), &mut rng);
			latents = output.prev_sample().to_owned();
		}
		latents
	};

	assert_eq!(run(1185332774), run(1185332774));
	assert_ne!(run(1185332774), run(7));
}

#[test]
fn set_timesteps_resets_multistep_state() {
	// run a few steps, then reconfigure; the second run must behave like a fresh scheduler
	for kind in [SchedulerKind::DpmSolverMultistep, SchedulerKind::UniPcMultistep, SchedulerKind::Pndm, SchedulerKind::Klms] {
		let mut scheduler = kind.scheduler().unwrap();
		let mut rng = StdRng::seed_from_u64(3);

		scheduler.set_timesteps(8);
		let latents = Array4::<f32>::random_using(LATENT_SHAPE, StandardNormal, &mut rng);
		for t in scheduler.timesteps().to_owned().iter().take(3) {
			let scaled = scheduler.scale_model_input(latents.view(), *t);
			scheduler.step(scaled.view(), *t, latents.view(), &mut rng);
		}

		scheduler.set_timesteps(25);
		assert_eq!(scheduler.timesteps().len(), if kind == SchedulerKind::Pndm { 26 } else { 25 }, "{kind}");

		let t0 = scheduler.timesteps()[0];
		let scaled = scheduler.scale_model_input(latents.view(), t0);
		let output = scheduler.step(scaled.view(), t0, latents.view(), &mut rng);
		assert!(output.prev_sample().iter().all(|f| f.is_finite()), "{kind}");
	}
}
