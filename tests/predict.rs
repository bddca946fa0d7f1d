use std::path::Path;

use image::{DynamicImage, GenericImageView};
use pastiche::{Error, Img2ImgOptions, Img2ImgPipeline, PredictionRequest, Predictor, Scheduler};

/// A pipeline double that returns flat images of the requested batch size without touching ONNX
/// Runtime.
struct MockPipeline;

impl Img2ImgPipeline for MockPipeline {
	fn img2img(&self, options: &Img2ImgOptions, _scheduler: &mut Scheduler) -> anyhow::Result<Vec<DynamicImage>> {
		let reference = options.reference_image().expect("predictor must always set a reference image");
		let (width, height) = reference.dimensions();
		Ok(vec![DynamicImage::new_rgb8(width, height); options.num_images()])
	}
}

/// A pipeline double that fails, standing in for an out-of-memory session error.
struct FailingPipeline;

impl Img2ImgPipeline for FailingPipeline {
	fn img2img(&self, _options: &Img2ImgOptions, _scheduler: &mut Scheduler) -> anyhow::Result<Vec<DynamicImage>> {
		anyhow::bail!("session run failed: out of memory")
	}
}

fn write_input(dir: &Path, width: u32, height: u32) -> std::path::PathBuf {
	let path = dir.join("input.png");
	DynamicImage::new_rgb8(width, height).save(&path).unwrap();
	path
}

#[test]
fn writes_one_output_file_per_requested_image() {
	let dir = tempfile::tempdir().unwrap();
	let input = write_input(dir.path(), 64, 64);

	let predictor = Predictor::new(MockPipeline).with_output_dir(dir.path());
	let mut request = PredictionRequest::new(input);
	request.num_outputs = 3;
	request.seed = Some(1185332774);

	let paths = predictor.predict(&request).unwrap();
	assert_eq!(paths.len(), 3);
	for (i, path) in paths.iter().enumerate() {
		assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("out-{i}.png"));
		let output = image::open(path).unwrap();
		assert_eq!(output.dimensions(), (64, 64));
	}
}

#[test]
fn oversized_inputs_reach_the_pipeline_downscaled() {
	let dir = tempfile::tempdir().unwrap();
	let input = write_input(dir.path(), 1920, 1080);

	let predictor = Predictor::new(MockPipeline).with_output_dir(dir.path());
	let request = PredictionRequest::new(input);

	let paths = predictor.predict(&request).unwrap();
	// the mock echoes the conditioning image's dimensions back out
	let output = image::open(&paths[0]).unwrap();
	assert_eq!(output.dimensions(), (1182, 665));
}

#[test]
fn parameters_are_validated_before_the_pipeline_runs() {
	let dir = tempfile::tempdir().unwrap();
	let input = write_input(dir.path(), 16, 16);
	let predictor = Predictor::new(FailingPipeline).with_output_dir(dir.path());

	let cases: [(&str, Box<dyn Fn(&mut PredictionRequest)>); 5] = [
		("num_outputs", Box::new(|r| r.num_outputs = 9)),
		("num_inference_steps", Box::new(|r| r.num_inference_steps = 501)),
		("guidance_scale", Box::new(|r| r.guidance_scale = 0.5)),
		("prompt_strength", Box::new(|r| r.prompt_strength = 1.5)),
		("max_image_size", Box::new(|r| r.max_image_size = 0))
	];
	for (name, mutate) in cases {
		let mut request = PredictionRequest::new(&input);
		mutate(&mut request);
		match predictor.predict(&request) {
			// the failing pipeline proves validation rejected the request first
			Err(Error::InvalidParameter { name: actual, .. }) => assert_eq!(actual, name),
			other => panic!("expected InvalidParameter for {name}, got {other:?}")
		}
	}
}

#[test]
fn missing_input_image_is_an_image_load_error() {
	let dir = tempfile::tempdir().unwrap();
	let predictor = Predictor::new(MockPipeline).with_output_dir(dir.path());
	let request = PredictionRequest::new(dir.path().join("nope.png"));

	match predictor.predict(&request) {
		Err(Error::ImageLoad { path, .. }) => assert!(path.ends_with("nope.png")),
		other => panic!("expected ImageLoad, got {other:?}")
	}
}

#[test]
fn pipeline_failures_surface_unmodified() {
	let dir = tempfile::tempdir().unwrap();
	let input = write_input(dir.path(), 16, 16);
	let predictor = Predictor::new(FailingPipeline).with_output_dir(dir.path());

	match predictor.predict(&PredictionRequest::new(input)) {
		Err(e @ Error::Pipeline(_)) => assert!(e.to_string().contains("out of memory")),
		other => panic!("expected Pipeline error, got {other:?}")
	}
}
