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

//! Load a model once, then turn prompts into PNG files.

use std::{
	fmt,
	fs,
	path::{Path, PathBuf},
	sync::Arc,
	time::Instant
};

use anyhow::Context;
use image::DynamicImage;
use rand::Rng;

use crate::{
	output,
	pipelines::ProgressCallback,
	prompting::clean_prompt,
	DiffusionDeviceControl, DiffusionScheduler, GenerationSettings, ImageGenError, ModelSource, OrtEnvironment, SchedulerConfig,
	StableDiffusionOptions, StableDiffusionPipeline, Txt2ImgOptions
};

/// Everything needed to generate a single image.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
	/// The prompt as passed to the text encoder.
	pub prompt: &'a str,
	/// Size, steps, guidance and sampler.
	pub settings: &'a GenerationSettings,
	/// Seed of the initial noise.
	pub seed: u64
}

/// A model that turns a [`GenerationRequest`] into an image.
pub trait TextToImage {
	/// Checks that `settings` can be run on this model before any image is generated.
	fn validate(&self, settings: &GenerationSettings) -> anyhow::Result<()> {
		settings.validate()
	}

	/// Generates exactly one image. `progress` is called after every denoising step with `(step, total)`.
	fn generate(&mut self, request: &GenerationRequest<'_>, progress: &mut ProgressCallback<'_>) -> anyhow::Result<DynamicImage>;
}

/// Stable Diffusion through ONNX Runtime, with the scheduler picked by [`GenerationSettings::scheduler`].
pub struct StableDiffusionBackend {
	pipeline: StableDiffusionPipeline,
	scheduler: Box<dyn DiffusionScheduler>,
	schedule: SchedulerConfig
}

impl StableDiffusionBackend {
	/// Resolves `source` (downloading files if needed) and loads the pipeline onto `devices`.
	pub fn load(source: &ModelSource, devices: DiffusionDeviceControl, settings: &GenerationSettings) -> anyhow::Result<Self> {
		let files = source.resolve().with_context(|| format!("failed to locate {source}"))?;
		let environment = Arc::new(OrtEnvironment::builder().with_name("sd-imagegen").build()?);
		let scheduler = settings.scheduler.build(&files.manifest.scheduler)?;
		tracing::debug!("using the {} scheduler", settings.scheduler);
		let pipeline = StableDiffusionPipeline::new(&environment, &files, StableDiffusionOptions { devices })?;
		Ok(Self {
			pipeline,
			scheduler,
			schedule: files.manifest.scheduler
		})
	}
}

impl TextToImage for StableDiffusionBackend {
	fn validate(&self, settings: &GenerationSettings) -> anyhow::Result<()> {
		settings.validate_for(&self.schedule)
	}

	fn generate(&mut self, request: &GenerationRequest<'_>, progress: &mut ProgressCallback<'_>) -> anyhow::Result<DynamicImage> {
		let images = Txt2ImgOptions::from_settings(request.settings)
			.with_prompt(request.prompt)
			.with_seed(request.seed)
			.run_with_progress(&self.pipeline, self.scheduler.as_mut(), progress)?;
		images.into_iter().next().ok_or_else(|| anyhow::anyhow!("pipeline returned no image"))
	}
}

/// An image written by [`ImageGenerator::generate_images`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
	/// Where the PNG was saved.
	pub path: PathBuf,
	/// Seed the image was generated with; reuse it to reproduce the image.
	pub seed: u64
}

/// Generates and saves images with fixed [`GenerationSettings`], loading the model only once.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use sd_imagegen::{GenerationSettings, ImageGenerator, ModelSource};
///
/// let mut generator = ImageGenerator::new(GenerationSettings::default());
/// generator.load_model(&ModelSource::local("./stable-diffusion-v1-5/"), Default::default())?;
/// let saved = generator.generate_images("a cute robot, digital art", 2, "generated_images")?;
/// assert_eq!(saved.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct ImageGenerator<B = StableDiffusionBackend> {
	settings: GenerationSettings,
	backend: Option<B>,
	progress: Option<Box<dyn FnMut(usize, usize)>>
}

impl<B> fmt::Debug for ImageGenerator<B> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ImageGenerator")
			.field("settings", &self.settings)
			.field("loaded", &self.backend.is_some())
			.finish()
	}
}

impl ImageGenerator<StableDiffusionBackend> {
	/// Creates a generator with no model loaded.
	pub fn new(settings: GenerationSettings) -> Self {
		Self {
			settings,
			backend: None,
			progress: None
		}
	}

	/// Loads Stable Diffusion from `source`. Replaces any previously loaded model.
	pub fn load_model(&mut self, source: &ModelSource, devices: DiffusionDeviceControl) -> anyhow::Result<()> {
		tracing::info!("loading {source}");
		let start = Instant::now();
		let backend = StableDiffusionBackend::load(source, devices, &self.settings).context("failed to load model")?;
		self.backend = Some(backend);
		tracing::info!("model loaded in {:.1?}", start.elapsed());
		Ok(())
	}
}

impl<B: TextToImage> ImageGenerator<B> {
	/// Creates a generator around an already loaded backend.
	pub fn with_backend(settings: GenerationSettings, backend: B) -> Self {
		Self {
			settings,
			backend: Some(backend),
			progress: None
		}
	}

	/// Registers a hook called after every denoising step of every image with `(step, total)`.
	pub fn on_progress(&mut self, hook: impl FnMut(usize, usize) + 'static) {
		self.progress = Some(Box::new(hook));
	}

	/// The settings every image is generated with.
	pub fn settings(&self) -> &GenerationSettings {
		&self.settings
	}

	/// Whether a model has been loaded.
	pub fn is_loaded(&self) -> bool {
		self.backend.is_some()
	}

	/// Generates `num_images` images of `prompt` and saves them to `output_dir/{slug}_{i}.png` (`i` starting at 1),
	/// creating the directory if needed.
	///
	/// # Errors
	/// - [`ImageGenError::ModelNotLoaded`] if no model was loaded
	/// - [`ImageGenError::NoImagesRequested`] if `num_images` is 0
	/// - [`ImageGenError::InvalidSettings`] if the settings cannot be run
	/// - any error from the model or from writing files; images saved before the failure stay on disk
	pub fn generate_images(&mut self, prompt: &str, num_images: usize, output_dir: impl AsRef<Path>) -> anyhow::Result<Vec<GeneratedImage>> {
		let backend = self.backend.as_mut().ok_or(ImageGenError::ModelNotLoaded)?;
		if num_images == 0 {
			return Err(ImageGenError::NoImagesRequested.into());
		}
		backend.validate(&self.settings)?;

		let output_dir = output_dir.as_ref();
		fs::create_dir_all(output_dir).with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

		let model_prompt = if self.settings.clean_prompt { clean_prompt(prompt) } else { prompt.to_string() };
		if model_prompt != prompt {
			tracing::debug!("cleaned prompt: {model_prompt:?}");
		}

		let progress_hook = &mut self.progress;
		let mut progress = |step: usize, total: usize| {
			if let Some(hook) = progress_hook.as_mut() {
				hook(step, total);
			}
			true
		};

		let start = Instant::now();
		let mut saved = Vec::with_capacity(num_images);
		for index in 1..=num_images {
			let seed = match self.settings.seed {
				Some(base) => base.wrapping_add(index as u64 - 1),
				None => rand::thread_rng().gen()
			};
			tracing::info!("generating image {index}/{num_images} (seed {seed})");

			let request = GenerationRequest {
				prompt: &model_prompt,
				settings: &self.settings,
				seed
			};
			let image = backend.generate(&request, &mut progress)?;
			let path = output::image_path(output_dir, prompt, index);
			output::save_png(&image, &path)?;
			tracing::info!("saved {}", path.display());
			saved.push(GeneratedImage { path, seed });
		}
		tracing::info!("generated {num_images} image(s) in {:.1?}", start.elapsed());

		Ok(saved)
	}
}
