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

//! CLIP tokenizer.

use std::path::Path;

use anyhow::Context;
use ndarray::Array2;
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::config::TokenizerConfig;

/// A [CLIP](https://arxiv.org/abs/2103.00020) tokenizer producing fixed-length token sequences for a CLIP text model.
pub struct ClipTokenizer {
	inner: Tokenizer,
	model_max_length: usize
}

impl ClipTokenizer {
	/// Loads a tokenizer from a `tokenizer.json` file.
	pub fn from_file(path: impl AsRef<Path>, config: &TokenizerConfig) -> anyhow::Result<Self> {
		let path = path.as_ref();
		let bytes = std::fs::read(path).with_context(|| format!("failed to read tokenizer {}", path.display()))?;
		Self::from_bytes(bytes, config)
	}

	/// Loads a tokenizer from the contents of a `tokenizer.json` file.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, config: &TokenizerConfig) -> anyhow::Result<Self> {
		let mut inner: Tokenizer = serde_json::from_slice(bytes.as_ref()).context("not a valid tokenizer.json")?;
		let pad_token = inner.id_to_token(config.eos_token).unwrap_or_else(|| "<|endoftext|>".to_string());
		inner.with_padding(Some(PaddingParams {
			strategy: PaddingStrategy::Fixed(config.model_max_length),
			direction: PaddingDirection::Right,
			pad_id: config.eos_token,
			pad_token,
			..Default::default()
		}));
		inner.with_truncation(Some(TruncationParams {
			max_length: config.model_max_length,
			..Default::default()
		}));
		Ok(Self {
			inner,
			model_max_length: config.model_max_length
		})
	}

	/// Returns the number of tokens every encoded prompt has. For most CLIP models, this is 77 tokens.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.model_max_length
	}

	/// Encodes the prompts into an array of token IDs of shape `(prompts.len(), self.len())`, to be passed to a CLIP
	/// text model.
	pub fn encode_for_text_model(&self, prompts: &[String]) -> anyhow::Result<Array2<i32>> {
		let encodings = self
			.inner
			.encode_batch(prompts.to_vec(), true)
			.map_err(|e| anyhow::anyhow!("failed to tokenize prompt: {e}"))?;
		let ids = encodings
			.iter()
			.flat_map(|encoding| encoding.get_ids().iter().map(|&id| id as i32))
			.collect::<Vec<_>>();
		Ok(Array2::from_shape_vec((prompts.len(), self.len()), ids)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const TOKENIZER_JSON: &str = r#"{
		"version": "1.0",
		"truncation": null,
		"padding": null,
		"added_tokens": [],
		"normalizer": null,
		"pre_tokenizer": { "type": "Whitespace" },
		"post_processor": null,
		"decoder": null,
		"model": {
			"type": "WordLevel",
			"vocab": { "<|startoftext|>": 0, "<|endoftext|>": 1, "a": 2, "red": 3, "fox": 4, "[UNK]": 5 },
			"unk_token": "[UNK]"
		}
	}"#;

	fn tokenizer() -> ClipTokenizer {
		let config = TokenizerConfig {
			model_max_length: 4,
			eos_token: 1,
			..Default::default()
		};
		ClipTokenizer::from_bytes(TOKENIZER_JSON, &config).unwrap()
	}

	#[test]
	fn pads_and_truncates_to_model_length() {
		let tokenizer = tokenizer();
		assert_eq!(tokenizer.len(), 4);

		let prompts = ["fox", "a red fox", "a red fox a red fox"].map(String::from);
		let ids = tokenizer.encode_for_text_model(&prompts).unwrap();
		assert_eq!(ids.shape(), [3, 4]);
		assert_eq!(ids.row(0).to_vec(), [4, 1, 1, 1]);
		assert_eq!(ids.row(1).to_vec(), [2, 3, 4, 1]);
		assert_eq!(ids.row(2).to_vec(), [2, 3, 4, 2]);
	}

	#[test]
	fn empty_prompt_is_all_padding() {
		let ids = tokenizer().encode_for_text_model(&[String::new()]).unwrap();
		assert_eq!(ids.row(0).to_vec(), [1, 1, 1, 1]);
	}

	#[test]
	fn rejects_malformed_tokenizer() {
		assert!(ClipTokenizer::from_bytes("{}", &TokenizerConfig::default()).is_err());
	}
}
