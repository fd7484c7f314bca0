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

//! Locating model files on disk or on the 🤗 Hub.

use std::{
	fmt::{self, Display},
	path::{Path, PathBuf}
};

use crate::{config::ModelManifest, ImageGenError};

/// Hub repository used when no model is given.
pub const DEFAULT_REPO: &str = "runwayml/stable-diffusion-v1-5";
/// Branch of [`DEFAULT_REPO`] holding the ONNX export.
pub const DEFAULT_REVISION: &str = "onnx";
/// Hub repository providing the CLIP `tokenizer.json`; ONNX exports only ship the slow tokenizer files.
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Where to load a Stable Diffusion model from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelSource {
	/// A local directory, optionally containing an `sd-imagegen.toml` manifest.
	Local(PathBuf),
	/// The ONNX export of a 🤗 Hub repository, downloaded to (and reused from) the Hub cache.
	#[cfg(feature = "hub")]
	Hub {
		/// Repository ID, e.g. `runwayml/stable-diffusion-v1-5`.
		repo: String,
		/// Branch, tag, or commit.
		revision: String
	}
}

impl Default for ModelSource {
	#[cfg(feature = "hub")]
	fn default() -> Self {
		Self::Hub {
			repo: DEFAULT_REPO.to_string(),
			revision: DEFAULT_REVISION.to_string()
		}
	}

	#[cfg(not(feature = "hub"))]
	fn default() -> Self {
		Self::Local(PathBuf::from("./stable-diffusion-v1-5"))
	}
}

impl Display for ModelSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Local(root) => write!(f, "local model at {}", root.display()),
			#[cfg(feature = "hub")]
			Self::Hub { repo, revision } => write!(f, "hub model {repo}@{revision}")
		}
	}
}

/// Resolved paths of every file a pipeline needs, plus the manifest they came from.
#[derive(Debug, Clone)]
pub struct ModelFiles {
	/// The CLIP `tokenizer.json`.
	pub tokenizer: PathBuf,
	/// The text encoder graph.
	pub text_encoder: PathBuf,
	/// The UNet graph.
	pub unet: PathBuf,
	/// The VAE decoder graph.
	pub vae_decoder: PathBuf,
	/// Tokenizer and scheduler configuration.
	pub manifest: ModelManifest
}

impl ModelSource {
	/// A local model directory.
	pub fn local(root: impl Into<PathBuf>) -> Self {
		Self::Local(root.into())
	}

	/// Resolves the source into local file paths, downloading files if needed.
	pub fn resolve(&self) -> anyhow::Result<ModelFiles> {
		match self {
			Self::Local(root) => resolve_local(root),
			#[cfg(feature = "hub")]
			Self::Hub { repo, revision } => hub::resolve(repo, revision)
		}
	}
}

fn existing(path: PathBuf) -> anyhow::Result<PathBuf> {
	if path.is_file() { Ok(path) } else { Err(ImageGenError::MissingModelFile(path).into()) }
}

fn resolve_local(root: &Path) -> anyhow::Result<ModelFiles> {
	let manifest = ModelManifest::load_or_default(root)?;
	Ok(ModelFiles {
		tokenizer: existing(root.join(&manifest.tokenizer.path))?,
		text_encoder: existing(root.join(&manifest.text_encoder.path))?,
		unet: existing(root.join(&manifest.unet.path))?,
		vae_decoder: existing(root.join(&manifest.vae.decoder))?,
		manifest
	})
}

cfg_if::cfg_if! {
	if #[cfg(feature = "hub")] {
		mod hub {
			use anyhow::Context;
			use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};

			use super::{ModelFiles, CLIP_TOKENIZER_REPO};
			use crate::config::ModelManifest;

			/// UNets over 2 GB are exported with their weights in a separate file next to the graph.
			const UNET_EXTERNAL_WEIGHTS: &str = "unet/weights.pb";

			pub(super) fn resolve(repo: &str, revision: &str) -> anyhow::Result<ModelFiles> {
				let api = ApiBuilder::new().with_progress(true).build()?;
				let model = api.repo(Repo::with_revision(repo.to_string(), RepoType::Model, revision.to_string()));
				let fetch = |name: &str| {
					tracing::debug!("fetching {name} from {repo}@{revision}");
					model.get(name).with_context(|| format!("failed to fetch `{name}` from {repo}@{revision}"))
				};

				let manifest = ModelManifest::default();
				let text_encoder = fetch(&manifest.text_encoder.path)?;
				let unet = fetch(&manifest.unet.path)?;
				fetch(UNET_EXTERNAL_WEIGHTS)?;
				let vae_decoder = fetch(&manifest.vae.decoder)?;
				let tokenizer = api
					.model(CLIP_TOKENIZER_REPO.to_string())
					.get("tokenizer.json")
					.with_context(|| format!("failed to fetch the CLIP tokenizer from {CLIP_TOKENIZER_REPO}"))?;

				Ok(ModelFiles {
					tokenizer,
					text_encoder,
					unet,
					vae_decoder,
					manifest
				})
			}
		}
	}
}
