use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use pastiche::{resize_to_area, Error};

fn checkered(width: u32, height: u32) -> DynamicImage {
	let mut image = RgbImage::new(width, height);
	for (x, y, pixel) in image.enumerate_pixels_mut() {
		*pixel = Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]);
	}
	DynamicImage::ImageRgb8(image)
}

#[test]
fn downscales_landscape_to_budget() {
	let budget = 786_432_u64;
	let resized = resize_to_area(checkered(1920, 1080), budget).unwrap();
	let (width, height) = resized.dimensions();

	// x = round(sqrt(1920 / 1080 * 786432)), y = round(786432 / x)
	assert_eq!((width, height), (1182, 665));

	let area = u64::from(width) * u64::from(height);
	assert!(area <= budget + u64::from(width.max(height)));

	let ratio = f64::from(width) / f64::from(height);
	assert!((ratio - 1920.0 / 1080.0).abs() < 0.01);
}

#[test]
fn downscales_portrait_to_budget() {
	let budget = 786_432_u64;
	let resized = resize_to_area(checkered(1080, 1920), budget).unwrap();
	let (width, height) = resized.dimensions();

	assert!(width >= 1 && height >= 1);
	let area = u64::from(width) * u64::from(height);
	assert!(area <= budget + u64::from(width.max(height)));

	let ratio = f64::from(width) / f64::from(height);
	assert!((ratio - 1080.0 / 1920.0).abs() < 0.01);
}

#[test]
fn images_within_budget_pass_through_unchanged() {
	let image = checkered(512, 512);
	let reference = image.to_rgb8();

	let out = resize_to_area(image, 786_432).unwrap();
	assert_eq!(out.dimensions(), (512, 512));
	assert_eq!(out.to_rgb8().as_raw(), reference.as_raw());
}

#[test]
fn single_pixel_image_is_untouched() {
	let out = resize_to_area(checkered(1, 1), 786_432).unwrap();
	assert_eq!(out.dimensions(), (1, 1));
}

#[test]
fn resize_is_idempotent() {
	for (width, height) in [(1920, 1080), (1080, 1920), (3000, 3000), (997, 1511)] {
		let once = resize_to_area(checkered(width, height), 786_432).unwrap();
		let reference = once.to_rgb8();
		let twice = resize_to_area(once, 786_432).unwrap();
		assert_eq!(reference.dimensions(), twice.dimensions(), "{width}x{height}");
		assert_eq!(twice.to_rgb8().as_raw(), reference.as_raw(), "{width}x{height}");
	}
}

#[test]
fn zero_width_is_rejected() {
	let image = DynamicImage::new_rgb8(0, 100);
	match resize_to_area(image, 786_432) {
		Err(Error::InvalidDimensions { width: 0, height: 100 }) => {}
		other => panic!("expected InvalidDimensions, got {other:?}")
	}
}

#[test]
fn zero_budget_is_rejected() {
	match resize_to_area(checkered(16, 16), 0) {
		Err(Error::InvalidParameter { name: "max_area", .. }) => {}
		other => panic!("expected InvalidParameter, got {other:?}")
	}
}

#[test]
fn extreme_aspect_ratios_keep_a_one_pixel_floor() {
	let resized = resize_to_area(checkered(1, 20_000), 64).unwrap();
	let (width, height) = resized.dimensions();
	assert!(width >= 1 && height >= 1);
	assert!(u64::from(width) * u64::from(height) <= 64 + u64::from(width.max(height)));
}
