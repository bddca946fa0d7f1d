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

use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::Error;

/// Downscales an image so that its pixel count does not exceed `max_area`, preserving its aspect
/// ratio up to integer rounding.
///
/// Images already within the budget are returned unchanged (no resample, no copy). Otherwise the
/// target width is `round(sqrt(w / h * max_area))` and the target height is re-derived from the
/// budget as `round(max_area / x)`, so rounding error is absorbed into one dimension instead of
/// compounding in both. Both dimensions are clamped to a floor of 1 pixel. Resampling uses Lanczos3.
///
/// # Errors
/// - [`Error::InvalidDimensions`] if the image has a zero width or height
/// - [`Error::InvalidParameter`] if `max_area` is zero
pub fn resize_to_area(image: DynamicImage, max_area: u64) -> Result<DynamicImage, Error> {
	let (width, height) = image.dimensions();
	if width == 0 || height == 0 {
		return Err(Error::InvalidDimensions { width, height });
	}
	if max_area == 0 {
		return Err(Error::InvalidParameter {
			name: "max_area",
			value: max_area.to_string(),
			expected: "a positive pixel count"
		});
	}

	if u64::from(width) * u64::from(height) <= max_area {
		return Ok(image);
	}

	let (x, y) = target_dimensions(width, height, max_area);
	// rounding can leave the target a hair over budget at the same dimensions; resampling again
	// would only degrade the image, so the transform is a fixed point there
	if (x, y) == (width, height) {
		return Ok(image);
	}
	Ok(image.resize_exact(x, y, FilterType::Lanczos3))
}

/// Solves `x / y = w / h` and `x * y = max_area` for `x`; `y` is then derived from the budget
/// rather than the ratio.
fn target_dimensions(width: u32, height: u32, max_area: u64) -> (u32, u32) {
	let x = (f64::from(width) / f64::from(height) * max_area as f64).sqrt().round().max(1.0);
	let y = (max_area as f64 / x).round().max(1.0);
	(x as u32, y as u32)
}

#[cfg(test)]
mod tests {
	use super::target_dimensions;

	#[test]
	fn target_dimensions_absorb_rounding_into_height() {
		assert_eq!(target_dimensions(1920, 1080, 786_432), (1182, 665));
		assert_eq!(target_dimensions(1080, 1920, 786_432), (665, 1183));
		assert_eq!(target_dimensions(1000, 1000, 786_432), (887, 887));
	}

	#[test]
	fn target_dimensions_floor_at_one_pixel() {
		let (x, y) = target_dimensions(1, 100_000, 16);
		assert!(x >= 1 && y >= 1);
	}
}
