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

//! Model manifests and generation settings.

use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{ImageGenError, SchedulerKind};

/// File name of the manifest describing a model directory.
pub const MANIFEST_FILE: &str = "sd-imagegen.toml";

/// Describes where the models of a Stable Diffusion export live, relative to the model root.
///
/// Every section is optional; the defaults match the layout of a 🤗 diffusers ONNX export:
/// ```toml
/// [tokenizer]
/// path = "tokenizer/tokenizer.json"
///
/// [unet]
/// path = "unet/model.onnx"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ModelManifest {
	/// The CLIP tokenizer.
	pub tokenizer: TokenizerConfig,
	/// The CLIP text encoder.
	pub text_encoder: ModelPathConfig,
	/// The UNet.
	pub unet: ModelPathConfig,
	/// The variational autoencoder.
	pub vae: VaeConfig,
	/// The noise schedule the model was trained with.
	pub scheduler: SchedulerConfig
}

impl Default for ModelManifest {
	fn default() -> Self {
		Self {
			tokenizer: TokenizerConfig::default(),
			text_encoder: ModelPathConfig::at("text_encoder/model.onnx"),
			unet: ModelPathConfig::at("unet/model.onnx"),
			vae: VaeConfig::default(),
			scheduler: SchedulerConfig::default()
		}
	}
}

impl ModelManifest {
	/// Reads `root/sd-imagegen.toml`, falling back to defaults when the directory has no manifest.
	pub fn load_or_default(root: &Path) -> anyhow::Result<Self> {
		let path = root.join(MANIFEST_FILE);
		if !path.exists() {
			tracing::debug!("no {MANIFEST_FILE} in {}, using the default diffusers ONNX layout", root.display());
			return Ok(Self::default());
		}
		let text = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
		Self::from_toml(&text).with_context(|| format!("failed to parse {}", path.display()))
	}

	/// Parses a manifest from TOML text.
	pub fn from_toml(text: &str) -> anyhow::Result<Self> {
		Ok(toml::from_str(text)?)
	}
}

/// CLIP tokenizer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TokenizerConfig {
	/// Path to a `tokenizer.json` in the 🤗 tokenizers format.
	pub path: String,
	/// Number of tokens every prompt is padded or truncated to.
	pub model_max_length: usize,
	/// ID of the end-of-text token, also used for padding.
	pub eos_token: u32
}

impl Default for TokenizerConfig {
	fn default() -> Self {
		Self {
			path: "tokenizer/tokenizer.json".to_string(),
			model_max_length: 77,
			eos_token: 49407
		}
	}
}

/// Location of a single ONNX model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelPathConfig {
	/// Path to the `.onnx` file.
	pub path: String
}

impl ModelPathConfig {
	fn at(path: &str) -> Self {
		Self { path: path.to_string() }
	}
}

/// Location of the variational autoencoder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VaeConfig {
	/// Path to the decoder `.onnx` file.
	pub decoder: String
}

impl Default for VaeConfig {
	fn default() -> Self {
		Self { decoder: "vae_decoder/model.onnx".to_string() }
	}
}

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BetaSchedule {
	/// Betas spaced linearly between `beta_start` and `beta_end`.
	Linear,
	/// Square roots of the betas spaced linearly, as used by Stable Diffusion.
	ScaledLinear
}

/// The noise schedule of a model, shared by all schedulers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
	/// Number of diffusion steps the model was trained with.
	pub num_train_timesteps: usize,
	/// The first `beta`.
	pub beta_start: f32,
	/// The last `beta`.
	pub beta_end: f32,
	/// How betas are spaced between `beta_start` and `beta_end`.
	pub beta_schedule: BetaSchedule,
	/// Offset added to every inference timestep.
	pub steps_offset: usize,
	/// Whether the alpha product before the first train step is 1 instead of the product at step 0.
	pub set_alpha_to_one: bool
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			beta_start: 0.00085,
			beta_end: 0.012,
			beta_schedule: BetaSchedule::ScaledLinear,
			steps_offset: 1,
			set_alpha_to_one: false
		}
	}
}

/// Parameters of a generation run. The defaults are the fixed parameters of the generator: 20 steps, guidance
/// scale 7.5, 512x512.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GenerationSettings {
	/// Number of denoising steps.
	pub steps: usize,
	/// Classifier-free guidance scale. Values `<= 1` disable guidance.
	pub guidance_scale: f32,
	/// Image width in pixels; must be a multiple of 8.
	pub width: u32,
	/// Image height in pixels; must be a multiple of 8.
	pub height: u32,
	/// Sampler to use.
	pub scheduler: SchedulerKind,
	/// What the image should *not* look like.
	pub negative_prompt: Option<String>,
	/// Base seed; image `n` of a run uses `seed + n`. Random per image when unset.
	pub seed: Option<u64>,
	/// Tidy up commas and whitespace in the prompt before encoding it.
	pub clean_prompt: bool
}

impl Default for GenerationSettings {
	fn default() -> Self {
		Self {
			steps: 20,
			guidance_scale: 7.5,
			width: 512,
			height: 512,
			scheduler: SchedulerKind::default(),
			negative_prompt: None,
			seed: None,
			clean_prompt: false
		}
	}
}

impl GenerationSettings {
	/// Reads settings from a TOML file. Keys missing from the file keep their defaults.
	pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let path = path.as_ref();
		let text = fs::read_to_string(path).with_context(|| format!("failed to read settings file {}", path.display()))?;
		toml::from_str(&text).with_context(|| format!("failed to parse settings file {}", path.display()))
	}

	/// Checks that the settings can be run.
	pub fn validate(&self) -> anyhow::Result<()> {
		let invalid = |field: &'static str, reason: String| -> anyhow::Result<()> { Err(ImageGenError::InvalidSettings { field, reason }.into()) };
		if self.steps == 0 {
			return invalid("steps", "must be at least 1".to_string());
		}
		if !self.guidance_scale.is_finite() {
			return invalid("guidance-scale", format!("must be finite, got {}", self.guidance_scale));
		}
		for (field, value) in [("width", self.width), ("height", self.height)] {
			if value == 0 || value % 8 != 0 {
				return invalid(field, format!("must be a non-zero multiple of 8, got {value}"));
			}
		}
		Ok(())
	}

	/// Like [`GenerationSettings::validate`], also checking that the step count fits the model's noise schedule.
	pub fn validate_for(&self, schedule: &SchedulerConfig) -> anyhow::Result<()> {
		self.validate()?;
		if self.steps > schedule.num_train_timesteps {
			return Err(ImageGenError::InvalidSettings {
				field: "steps",
				reason: format!("must not exceed the {} timesteps the model was trained with, got {}", schedule.num_train_timesteps, self.steps)
			}
			.into());
		}
		Ok(())
	}
}
