use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by [`Predictor::predict`](crate::Predictor::predict).
///
/// Failures raised by the underlying diffusion pipeline are passed through unmodified in
/// [`Error::Pipeline`]; the predictor performs no retries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
	/// The input image has a zero width or height. Rejected up front; the aspect-ratio computation
	/// is undefined for degenerate images.
	#[error("invalid image dimensions {width}x{height}; width and height must both be nonzero")]
	InvalidDimensions {
		/// Width of the rejected image, in pixels.
		width: u32,
		/// Height of the rejected image, in pixels.
		height: u32
	},

	/// A request parameter is outside its accepted range.
	#[error("parameter `{name}` is out of range: got {value}, expected {expected}")]
	InvalidParameter {
		/// Name of the offending parameter.
		name: &'static str,
		/// The rejected value.
		value: String,
		/// Human-readable description of the accepted range.
		expected: &'static str
	},

	/// The input image could not be read or decoded.
	#[error("failed to read input image `{}`: {source}", .path.display())]
	ImageLoad {
		/// Path of the image that could not be read.
		path: PathBuf,
		#[source]
		source: image::ImageError
	},

	/// An output image could not be encoded or written.
	#[error("failed to write output image `{}`: {source}", .path.display())]
	ImageSave {
		/// Path of the image that could not be written.
		path: PathBuf,
		#[source]
		source: image::ImageError
	},

	/// The diffusion pipeline failed. The error is surfaced as-is from the pipeline; see the
	/// source chain for the underlying session error.
	#[error("diffusion pipeline failure: {0}")]
	Pipeline(#[source] anyhow::Error)
}
