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

use std::path::PathBuf;

use thiserror::Error;

/// Errors a caller may want to tell apart. They travel inside [`anyhow::Error`]; use
/// [`anyhow::Error::downcast_ref`] to inspect them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ImageGenError {
	/// [`ImageGenerator::generate_images`](crate::ImageGenerator::generate_images) was called before a model was loaded.
	#[error("model not loaded; call `load_model` first")]
	ModelNotLoaded,
	/// A generation setting is out of range.
	#[error("invalid setting `{field}`: {reason}")]
	InvalidSettings {
		/// Name of the offending setting.
		field: &'static str,
		/// What is wrong with it.
		reason: String
	},
	/// A file a model manifest points to does not exist.
	#[error("missing model file {}", .0.display())]
	MissingModelFile(PathBuf),
	/// Zero images were requested.
	#[error("at least one image must be requested")]
	NoImagesRequested
}
