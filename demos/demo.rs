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

use std::time::Instant;

use sd_imagegen::{DeviceChoice, DiffusionDeviceControl, GenerationSettings, ImageGenerator, ModelSource};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const OUTPUT_DIR: &str = "demo_output";

const PROMPTS: [&str; 4] = [
	"a cute robot painting a picture, digital art, vibrant colors",
	"sunset over a mountain lake, photorealistic, highly detailed",
	"watercolor painting of autumn leaves, artistic, soft colors",
	"futuristic cyberpunk city at night, neon lights, detailed buildings"
];

fn main() -> anyhow::Result<()> {
	let filter = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let mut generator = ImageGenerator::new(GenerationSettings::default());
	generator.load_model(&ModelSource::default(), DiffusionDeviceControl::all(DeviceChoice::Auto.resolve(0, false)))?;

	tracing::info!("generating 1 image for each of {} prompts", PROMPTS.len());
	let start = Instant::now();
	for (i, prompt) in PROMPTS.iter().enumerate() {
		tracing::info!("[{}/{}] {prompt:?}", i + 1, PROMPTS.len());
		match generator.generate_images(prompt, 1, OUTPUT_DIR) {
			Ok(_) => tracing::info!("completed prompt {}/{}", i + 1, PROMPTS.len()),
			Err(e) => tracing::error!("failed for prompt {prompt:?}: {e:#}")
		}
	}
	tracing::info!("demo completed in {:.1?}; images are in {OUTPUT_DIR}/", start.elapsed());

	Ok(())
}
