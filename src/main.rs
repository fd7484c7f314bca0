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

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use sd_imagegen::{DeviceChoice, DiffusionDeviceControl, GenerationSettings, ImageGenerator, ModelSource, SchedulerKind};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Generate images from a text prompt with Stable Diffusion.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
	/// Text prompt describing the image.
	#[arg(long)]
	prompt: String,

	/// Number of images to generate.
	#[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
	num_images: u32,

	/// Directory to save the images to. Created if missing.
	#[arg(long, default_value = "generated_images")]
	output_dir: PathBuf,

	/// Local model directory (a diffusers ONNX export, optionally with an `sd-imagegen.toml` manifest).
	#[arg(long)]
	model: Option<PathBuf>,

	/// 🤗 Hub repository to download the model from when `--model` is not given.
	#[cfg(feature = "hub")]
	#[arg(long, default_value = sd_imagegen::source::DEFAULT_REPO, conflicts_with = "model")]
	repo: String,

	/// Branch of `--repo` holding the ONNX export.
	#[cfg(feature = "hub")]
	#[arg(long, default_value = sd_imagegen::source::DEFAULT_REVISION, conflicts_with = "model")]
	revision: String,

	/// TOML file with generation settings. Flags given on the command line take precedence.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Number of denoising steps [default: 20]
	#[arg(long)]
	steps: Option<usize>,

	/// Classifier-free guidance scale [default: 7.5]
	#[arg(long)]
	guidance_scale: Option<f32>,

	/// Image width, a multiple of 8 [default: 512]
	#[arg(long)]
	width: Option<u32>,

	/// Image height, a multiple of 8 [default: 512]
	#[arg(long)]
	height: Option<u32>,

	/// Base seed. Image `n` uses `seed + n - 1`.
	#[arg(long)]
	seed: Option<u64>,

	/// Sampler [default: pndm]
	#[arg(long, value_enum)]
	scheduler: Option<SchedulerKind>,

	/// What the image should not look like.
	#[arg(long)]
	negative_prompt: Option<String>,

	/// Tidy up commas and whitespace in the prompt before generating.
	#[arg(long)]
	clean_prompt: bool,

	/// Device to run the models on.
	#[arg(long, value_enum, default_value_t = DeviceChoice::Auto)]
	device: DeviceChoice,

	/// GPU index for CUDA.
	#[arg(long, default_value_t = 0)]
	device_id: usize,

	/// Limit per-model GPU memory, for GPUs with little VRAM.
	#[arg(long)]
	low_vram: bool
}

impl Args {
	fn settings(&self) -> anyhow::Result<GenerationSettings> {
		let mut settings = match &self.config {
			Some(path) => GenerationSettings::from_file(path)?,
			None => GenerationSettings::default()
		};
		if let Some(steps) = self.steps {
			settings.steps = steps;
		}
		if let Some(guidance_scale) = self.guidance_scale {
			settings.guidance_scale = guidance_scale;
		}
		if let Some(width) = self.width {
			settings.width = width;
		}
		if let Some(height) = self.height {
			settings.height = height;
		}
		if let Some(scheduler) = self.scheduler {
			settings.scheduler = scheduler;
		}
		if self.seed.is_some() {
			settings.seed = self.seed;
		}
		if self.negative_prompt.is_some() {
			settings.negative_prompt.clone_from(&self.negative_prompt);
		}
		settings.clean_prompt |= self.clean_prompt;
		Ok(settings)
	}

	fn source(&self) -> ModelSource {
		match &self.model {
			Some(root) => ModelSource::local(root),
			#[cfg(feature = "hub")]
			None => ModelSource::Hub {
				repo: self.repo.clone(),
				revision: self.revision.clone()
			},
			#[cfg(not(feature = "hub"))]
			None => ModelSource::default()
		}
	}
}

fn run(args: Args) -> anyhow::Result<()> {
	let settings = args.settings()?;
	settings.validate()?;

	let device = args.device.resolve(args.device_id, args.low_vram);
	tracing::info!("running on {}", device.describe());

	let mut generator = ImageGenerator::new(settings);
	generator.load_model(&args.source(), DiffusionDeviceControl::all(device))?;

	let style = ProgressStyle::with_template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] step {pos}/{len} ({eta})")?.progress_chars("#>-");
	let mut bar: Option<ProgressBar> = None;
	generator.on_progress(move |step, total| {
		if step == 1 {
			bar = Some(ProgressBar::new(total as u64).with_style(style.clone()));
		}
		if let Some(bar) = &bar {
			bar.set_position(step as u64);
			if step == total {
				bar.finish_and_clear();
			}
		}
	});

	let saved = generator.generate_images(&args.prompt, args.num_images as usize, &args.output_dir)?;
	tracing::info!("Generated {} image(s) in {}", saved.len(), args.output_dir.display());
	Ok(())
}

fn main() -> ExitCode {
	let args = Args::parse();

	let filter = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
	tracing_subscriber::fmt().with_env_filter(filter).init();

	match run(args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{e:#}");
			ExitCode::FAILURE
		}
	}
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;

	#[test]
	fn flags_override_settings_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("settings.toml");
		fs::write(&path, "steps = 10\nseed = 5\nguidance-scale = 3.0\nnegative-prompt = \"blurry\"\nclean-prompt = true\n").unwrap();

		let args = Args::try_parse_from([
			"sd-imagegen",
			"--prompt",
			"x",
			"--config",
			path.to_str().unwrap(),
			"--steps",
			"30",
			"--negative-prompt",
			"dark"
		])
		.unwrap();
		let settings = args.settings().unwrap();
		assert_eq!(settings.steps, 30);
		assert_eq!(settings.seed, Some(5));
		assert_eq!(settings.guidance_scale, 3.0);
		assert_eq!(settings.negative_prompt.as_deref(), Some("dark"));
		assert!(settings.clean_prompt);
		assert_eq!((settings.width, settings.height), (512, 512));
	}

	#[test]
	fn flags_apply_over_defaults() {
		let args = Args::try_parse_from(["sd-imagegen", "--prompt", "x", "--width", "640", "--scheduler", "euler", "--clean-prompt"]).unwrap();
		let settings = args.settings().unwrap();
		assert_eq!(settings.width, 640);
		assert_eq!(settings.height, 512);
		assert_eq!(settings.steps, 20);
		assert_eq!(settings.scheduler, SchedulerKind::Euler);
		assert_eq!(settings.seed, None);
		assert!(settings.clean_prompt);
	}

	#[test]
	fn missing_settings_file_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("missing.toml");
		let args = Args::try_parse_from(["sd-imagegen", "--prompt", "x", "--config", path.to_str().unwrap()]).unwrap();
		assert!(args.settings().is_err());
	}

	#[test]
	fn zero_images_are_rejected() {
		assert!(Args::try_parse_from(["sd-imagegen", "--prompt", "x", "--num-images", "0"]).is_err());
		assert_eq!(Args::try_parse_from(["sd-imagegen", "--prompt", "x"]).unwrap().num_images, 1);
	}
}
