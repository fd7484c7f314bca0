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

use image::DynamicImage;
use ndarray::{concatenate, s, Array1, Array4, Axis, IxDyn};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use ort::tensor::{FromArray, InputTensor, OrtOwnedTensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::ProgressCallback;
use crate::{DiffusionScheduler, GenerationSettings, Prompt, StableDiffusionPipeline};

/// Options for a text-to-image run of the [`StableDiffusionPipeline`].
#[derive(Debug, Clone)]
pub struct Txt2ImgOptions {
	pub(crate) height: u32,
	pub(crate) width: u32,
	pub(crate) guidance_scale: f32,
	pub(crate) steps: usize,
	pub(crate) seed: Option<u64>,
	pub(crate) positive_prompt: Prompt,
	pub(crate) negative_prompt: Option<Prompt>
}

impl Default for Txt2ImgOptions {
	fn default() -> Self {
		Self {
			height: 512,
			width: 512,
			guidance_scale: 7.5,
			steps: 20,
			seed: None,
			positive_prompt: Prompt::default(),
			negative_prompt: None
		}
	}
}

impl Txt2ImgOptions {
	/// Options taking size, steps, guidance scale, and negative prompt from [`GenerationSettings`].
	pub fn from_settings(settings: &GenerationSettings) -> Self {
		Self::default()
			.with_size(settings.width, settings.height)
			.with_steps(settings.steps)
			.with_guidance_scale(settings.guidance_scale)
			.with_negative_prompt(settings.negative_prompt.clone())
	}

	/// Set the size of the image. **Size will be rounded down to a multiple of 8.**
	pub fn with_size(self, width: u32, height: u32) -> Self {
		self.with_width(width).with_height(height)
	}
	/// Set the width of the image. **Width will be rounded down to a multiple of 8.**
	#[inline]
	pub fn with_width(mut self, width: u32) -> Self {
		self.width = (width / 8).max(1) * 8;
		self
	}
	/// Set the height of the image. **Height will be rounded down to a multiple of 8.**
	#[inline]
	pub fn with_height(mut self, height: u32) -> Self {
		self.height = (height / 8).max(1) * 8;
		self
	}
	/// The number of steps to take to generate the image. More steps typically yields higher quality images.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// Set the prompt(s) to use when generating the image.
	pub fn with_prompts<P>(mut self, positive_prompt: P, negative_prompt: Option<P>) -> Self
	where
		P: Into<Prompt>
	{
		self.positive_prompt = positive_prompt.into();
		self.negative_prompt = negative_prompt.map(|p| p.into());
		self
	}
	/// Set only the positive prompt(s), keeping the negative prompt.
	pub fn with_prompt(mut self, prompt: impl Into<Prompt>) -> Self {
		self.positive_prompt = prompt.into();
		self
	}
	/// Set or clear the negative prompt.
	pub fn with_negative_prompt(mut self, negative_prompt: Option<impl Into<Prompt>>) -> Self {
		self.negative_prompt = negative_prompt.map(Into::into);
		self
	}
	/// Set the seed to use when first generating noise.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates a different image.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model more freedom, but the
	/// output may not match the prompt. A higher guidance scale mean the model will match the prompt(s) more strictly,
	/// but may introduce artifacts; `7.5` is a good balance.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}

	/// Image width in pixels.
	pub fn width(&self) -> u32 {
		self.width
	}
	/// Image height in pixels.
	pub fn height(&self) -> u32 {
		self.height
	}

	/// Generates images from the given text prompt(s). Returns a vector of [`image::DynamicImage`]s, using float32
	/// buffers. In most cases, you'll want to convert the images into RGB8 via `img.into_rgb8().`
	///
	/// `scheduler` must be a Stable Diffusion-compatible scheduler.
	pub fn run(&self, pipeline: &StableDiffusionPipeline, scheduler: &mut dyn DiffusionScheduler) -> anyhow::Result<Vec<DynamicImage>> {
		self.run_with_progress(pipeline, scheduler, &mut |_, _| true)
	}

	/// Like [`Txt2ImgOptions::run`], calling `progress` with `(completed, steps)` as denoising advances. `completed`
	/// runs from 1 to the requested step count, however many timesteps the scheduler visits.
	pub fn run_with_progress(
		&self,
		pipeline: &StableDiffusionPipeline,
		scheduler: &mut dyn DiffusionScheduler,
		progress: &mut ProgressCallback<'_>
	) -> anyhow::Result<Vec<DynamicImage>> {
		if self.positive_prompt.is_empty() {
			anyhow::bail!("at least one prompt is required");
		}
		if self.steps == 0 {
			anyhow::bail!("`steps` must be at least 1");
		}

		let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut rng = StdRng::seed_from_u64(seed);
		tracing::debug!("txt2img {}x{}, {} steps, guidance {}, seed {seed}", self.width, self.height, self.steps, self.guidance_scale);

		let batch_size = self.positive_prompt.len();
		let do_classifier_free_guidance = self.guidance_scale > 1.0;
		let text_embeddings = pipeline
			.encode_prompt(&self.positive_prompt, do_classifier_free_guidance, self.negative_prompt.as_ref())?
			.into_dyn();

		let latents_shape = (batch_size, 4_usize, (self.height / 8) as usize, (self.width / 8) as usize);
		let mut latents = Array4::<f32>::random_using(latents_shape, StandardNormal, &mut rng);

		scheduler.set_timesteps(self.steps);
		latents *= scheduler.init_noise_sigma();

		let timesteps = scheduler.timesteps().to_owned();
		let mut reported = 0;
		for (i, &t) in timesteps.iter().enumerate() {
			let latent_model_input = if do_classifier_free_guidance {
				concatenate![Axis(0), latents, latents]
			} else {
				latents.clone()
			};
			let latent_model_input = scheduler.scale_model_input(latent_model_input.view(), t).into_dyn();
			let timestep = if pipeline.unet_timestep_is_int64() {
				InputTensor::from_array(Array1::from_elem(1, t as i64).into_dyn())
			} else {
				InputTensor::from_array(Array1::from_elem(1, t).into_dyn())
			};

			let noise_pred = pipeline.unet.run(vec![InputTensor::from_array(latent_model_input), timestep, InputTensor::from_array(text_embeddings.clone())])?;
			let noise_pred: OrtOwnedTensor<'_, f32, IxDyn> = noise_pred[0].try_extract()?;
			let mut noise_pred: Array4<f32> = noise_pred.view().to_owned().into_dimensionality()?;

			if do_classifier_free_guidance {
				let noise_pred_uncond = noise_pred.slice(s![..batch_size, .., .., ..]);
				let noise_pred_text = noise_pred.slice(s![batch_size.., .., .., ..]);
				noise_pred = &noise_pred_uncond + self.guidance_scale * (&noise_pred_text - &noise_pred_uncond);
			}

			latents = scheduler.step(noise_pred.view(), t, latents.view(), &mut rng).into_prev_sample();

			let completed = completed_steps(i + 1, timesteps.len(), self.steps);
			if completed > reported {
				reported = completed;
				if !progress(completed, self.steps) {
					tracing::info!("stopped after {completed} of {} steps", self.steps);
					break;
				}
			}
		}

		pipeline.decode_latents(latents.view())
	}
}

/// Maps the number of visited timesteps onto the requested step count, which PNDM exceeds by one.
fn completed_steps(visited: usize, timesteps: usize, steps: usize) -> usize {
	visited * steps / timesteps
}

#[cfg(test)]
mod tests {
	use super::{completed_steps, Txt2ImgOptions};
	use crate::GenerationSettings;

	#[test]
	fn progress_counts_requested_steps() {
		let mut seen: Vec<usize> = (1..=21).map(|visited| completed_steps(visited, 21, 20)).collect();
		seen.dedup();
		assert_eq!(seen.first(), Some(&0));
		assert_eq!(&seen[1..], (1..=20).collect::<Vec<_>>());

		let same: Vec<usize> = (1..=20).map(|visited| completed_steps(visited, 20, 20)).collect();
		assert_eq!(same, (1..=20).collect::<Vec<_>>());
	}

	#[test]
	fn size_rounds_down_to_multiples_of_8() {
		let options = Txt2ImgOptions::default().with_size(517, 250);
		assert_eq!((options.width(), options.height()), (512, 248));
		let options = Txt2ImgOptions::default().with_size(3, 0);
		assert_eq!((options.width(), options.height()), (8, 8));
	}

	#[test]
	fn takes_fixed_parameters_from_settings() {
		let settings = GenerationSettings {
			negative_prompt: Some("blurry".to_string()),
			..Default::default()
		};
		let options = Txt2ImgOptions::from_settings(&settings).with_seed(9);
		assert_eq!(options.steps, 20);
		assert_eq!(options.guidance_scale, 7.5);
		assert_eq!((options.width, options.height), (512, 512));
		assert_eq!(options.negative_prompt.as_deref(), Some(&vec!["blurry".to_string()]));
		assert_eq!(options.seed, Some(9));
	}
}
