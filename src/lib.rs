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

//! `sd-imagegen` generates images from text prompts with [Stable Diffusion] on [ONNX Runtime], and saves them as
//! PNG files named after the prompt.
//!
//! The model is loaded once and reused for every image:
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use sd_imagegen::{DiffusionDeviceControl, GenerationSettings, ImageGenerator, ModelSource};
//!
//! let mut generator = ImageGenerator::new(GenerationSettings::default());
//! generator.load_model(&ModelSource::default(), DiffusionDeviceControl::default())?;
//! for image in generator.generate_images("sunset over a mountain lake, photorealistic", 2, "generated_images")? {
//! 	println!("{} (seed {})", image.path.display(), image.seed);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every image is generated with 20 inference steps, a guidance scale of 7.5, and a size of 512x512 unless the
//! [`GenerationSettings`] say otherwise. See [`StableDiffusionPipeline`] to drive the pipeline directly.
//!
//! [Stable Diffusion]: https://github.com/CompVis/stable-diffusion
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod clip;
pub mod config;
pub mod device;
mod error;
pub mod generator;
pub mod output;
pub mod pipelines;
pub mod schedulers;
pub mod source;
pub(crate) mod util;

pub use ort::Environment as OrtEnvironment;

pub use self::config::{GenerationSettings, ModelManifest, SchedulerConfig};
pub use self::device::{CudaDeviceOptions, DeviceChoice, DiffusionDevice, DiffusionDeviceControl};
pub use self::error::ImageGenError;
pub use self::generator::{GeneratedImage, GenerationRequest, ImageGenerator, StableDiffusionBackend, TextToImage};
pub use self::pipelines::*;
pub use self::schedulers::*;
pub use self::source::{ModelFiles, ModelSource};
pub use self::util::prompting;
