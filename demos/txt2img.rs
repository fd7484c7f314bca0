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

use std::{env, path::Path, sync::Arc};

use sd_imagegen::{output, ModelSource, OrtEnvironment, SchedulerKind, StableDiffusionOptions, StableDiffusionPipeline, Txt2ImgOptions};

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt::init();

	let source = match env::args().nth(1) {
		Some(root) => ModelSource::local(root),
		None => ModelSource::default()
	};
	let files = source.resolve()?;

	let environment = Arc::new(OrtEnvironment::builder().with_name("Stable Diffusion").build()?);
	let mut scheduler = SchedulerKind::EulerAncestral.build(&files.manifest.scheduler)?;
	let pipeline = StableDiffusionPipeline::new(&environment, &files, StableDiffusionOptions::default())?;

	let prompt = "photo of a red fox";
	let images = Txt2ImgOptions::default()
		.with_prompts(prompt, Some("blurry, low quality"))
		.with_seed(42)
		.run(&pipeline, scheduler.as_mut())?;
	for (i, image) in images.iter().enumerate() {
		output::save_png(image, &output::image_path(Path::new("."), prompt, i + 1))?;
	}

	Ok(())
}
