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

//! CLIP tokenizer implementation.

use std::path::PathBuf;

use ndarray::Array2;
use tokenizers::{EncodeInput, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// A basic [CLIP](https://arxiv.org/abs/2103.00020) tokenizer, used by Stable Diffusion for prompt
/// tokenization.
///
/// Encodings are padded with the end-of-string token to `model_max_length` and truncated to the
/// same length, so every prompt produces a fixed-shape input for the text encoder.
pub struct CLIPStandardTokenizer {
	inner: Tokenizer,
	model_max_length: usize,
	#[allow(dead_code)]
	bos_token_id: u32,
	eos_token_id: u32
}

unsafe impl Send for CLIPStandardTokenizer {}
unsafe impl Sync for CLIPStandardTokenizer {}

impl CLIPStandardTokenizer {
	/// Loads a CLIP tokenizer from a `tokenizer.json` file.
	pub fn new(path: impl Into<PathBuf>, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let path = path.into();
		let bytes = std::fs::read(path)?;
		Self::from_bytes(bytes, model_max_length, bos_token_id, eos_token_id)
	}

	/// Loads a CLIP tokenizer from a byte array.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let mut tokenizer: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		tokenizer.with_padding(Some(PaddingParams {
			strategy: PaddingStrategy::Fixed(model_max_length),
			pad_id: eos_token_id,
			pad_token: "<|endoftext|>".to_string(),
			..Default::default()
		}));
		tokenizer.with_truncation(Some(TruncationParams {
			max_length: model_max_length,
			..Default::default()
		}));
		Ok(Self {
			inner: tokenizer,
			model_max_length,
			bos_token_id,
			eos_token_id
		})
	}

	/// Returns the maximum length of encodings this tokenizer produces. For most CLIP models, this
	/// is 77 tokens.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.model_max_length
	}

	/// Returns the ID of the end-of-string token.
	#[allow(dead_code)]
	pub fn eos(&self) -> u32 {
		self.eos_token_id
	}

	/// Encodes the input prompts into an [`Array2`] of token IDs to be passed to a CLIP text model.
	pub fn encode_for_text_model<'s, E>(&self, enc: Vec<E>) -> anyhow::Result<Array2<i32>>
	where
		E: Into<EncodeInput<'s>> + Send
	{
		let batch_size = enc.len();
		Ok(Array2::from_shape_vec(
			(batch_size, self.len()),
			self.inner
				.encode_batch(enc, true)
				.map_err(|e| anyhow::anyhow!("{e:?}"))?
				.iter()
				.flat_map(|v| v.get_ids().iter().map(|tok| *tok as _).collect::<Vec<i32>>())
				.collect()
		)?)
	}
}
