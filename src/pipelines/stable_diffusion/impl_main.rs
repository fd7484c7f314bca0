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

use std::{path::Path, sync::Arc};

use anyhow::Context;
use image::{DynamicImage, Rgb32FImage};
use ndarray::{concatenate, Array3, Array4, ArrayView4, Axis, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor, TensorElementDataType},
	Environment, Session, SessionBuilder
};

use super::StableDiffusionOptions;
use crate::{clip::ClipTokenizer, source::ModelFiles, DiffusionDevice, Prompt};

/// Latents are scaled by this factor before they are decoded by the VAE of Stable Diffusion v1.
const VAE_SCALING_FACTOR: f32 = 0.18215;

/// A [Stable Diffusion](https://github.com/CompVis/stable-diffusion) pipeline.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use std::sync::Arc;
///
/// use sd_imagegen::{ModelSource, OrtEnvironment, SchedulerKind, StableDiffusionOptions, StableDiffusionPipeline, Txt2ImgOptions};
///
/// let environment = Arc::new(OrtEnvironment::builder().with_name("sd-imagegen").build()?);
/// let files = ModelSource::local("./stable-diffusion-v1-5/").resolve()?;
/// let mut scheduler = SchedulerKind::Pndm.build(&files.manifest.scheduler)?;
/// let pipeline = StableDiffusionPipeline::new(&environment, &files, StableDiffusionOptions::default())?;
///
/// let imgs = Txt2ImgOptions::default()
/// 	.with_prompts("photo of a red fox", None)
/// 	.run(&pipeline, scheduler.as_mut())?;
/// # Ok(())
/// # }
/// ```
pub struct StableDiffusionPipeline {
	tokenizer: ClipTokenizer,
	text_encoder: Session,
	pub(crate) unet: Session,
	vae_decoder: Session,
	unet_timestep_is_int64: bool
}

fn load_session(environment: &Arc<Environment>, name: &str, path: &Path, device: &DiffusionDevice) -> anyhow::Result<Session> {
	tracing::debug!("loading {name} from {} on {}", path.display(), device.describe());
	SessionBuilder::new(environment)?
		.with_execution_providers([device.clone().into()])?
		.with_model_from_file(path)
		.with_context(|| format!("failed to load {name} from {}", path.display()))
}

impl StableDiffusionPipeline {
	/// Creates a new Stable Diffusion pipeline, loading the tokenizer and all three models from resolved
	/// [`ModelFiles`].
	pub fn new(environment: &Arc<Environment>, files: &ModelFiles, options: StableDiffusionOptions) -> anyhow::Result<Self> {
		let devices = &options.devices;
		let tokenizer = ClipTokenizer::from_file(&files.tokenizer, &files.manifest.tokenizer)?;
		let text_encoder = load_session(environment, "text encoder", &files.text_encoder, &devices.text_encoder)?;
		let unet = load_session(environment, "UNet", &files.unet, &devices.unet)?;
		let vae_decoder = load_session(environment, "VAE decoder", &files.vae_decoder, &devices.vae_decoder)?;

		// diffusers exports declare the timestep as int64; some older conversions use float32
		let unet_timestep_is_int64 = unet
			.inputs
			.iter()
			.find(|input| input.name == "timestep")
			.map_or(false, |input| matches!(input.input_type, TensorElementDataType::Int64));
		tracing::debug!("UNet timestep input is {}", if unet_timestep_is_int64 { "int64" } else { "float32" });

		Ok(Self {
			tokenizer,
			text_encoder,
			unet,
			vae_decoder,
			unet_timestep_is_int64
		})
	}

	pub(crate) fn unet_timestep_is_int64(&self) -> bool {
		self.unet_timestep_is_int64
	}

	fn embed(&self, prompts: &[String]) -> anyhow::Result<Array3<f32>> {
		let input_ids = self.tokenizer.encode_for_text_model(prompts)?;
		let outputs = self.text_encoder.run(vec![InputTensor::from_array(input_ids.into_dyn())])?;
		let embeddings: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
		Ok(embeddings.view().to_owned().into_dimensionality()?)
	}

	/// Encodes the given prompt(s) into an array of text embeddings to be used as input to the UNet.
	///
	/// With classifier-free guidance, the unconditional embeddings (of `negative_prompt`, or of empty prompts) come
	/// first along the batch axis, followed by the embeddings of `prompt`.
	pub fn encode_prompt(&self, prompt: &Prompt, do_classifier_free_guidance: bool, negative_prompt: Option<&Prompt>) -> anyhow::Result<Array3<f32>> {
		let batch_size = prompt.len();
		let text_embeddings = self.embed(prompt)?;
		if !do_classifier_free_guidance {
			return Ok(text_embeddings);
		}

		let uncond_prompt = match negative_prompt {
			Some(negative_prompt) => negative_prompt.broadcast_to(batch_size)?,
			None => Prompt::empty_batch(batch_size)
		};
		let uncond_embeddings = self.embed(&uncond_prompt)?;
		Ok(concatenate![Axis(0), uncond_embeddings, text_embeddings])
	}

	fn to_image(&self, width: u32, height: u32, arr: &Array4<f32>) -> anyhow::Result<DynamicImage> {
		Ok(DynamicImage::ImageRgb32F(
			Rgb32FImage::from_raw(width, height, arr.map(|f| f.clamp(0.0, 1.0)).into_iter().collect::<Vec<_>>())
				.ok_or_else(|| anyhow::anyhow!("failed to construct image"))?
		))
	}

	/// Decodes UNet latents via the variational autoencoder into an array of [`image::DynamicImage`]s.
	pub fn decode_latents(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Vec<DynamicImage>> {
		let latents = &latents / VAE_SCALING_FACTOR;

		let mut images = Vec::with_capacity(latents.shape()[0]);
		for latent_chunk in latents.axis_iter(Axis(0)) {
			let latent_chunk = latent_chunk.insert_axis(Axis(0)).into_dyn().to_owned();
			let outputs = self.vae_decoder.run(vec![InputTensor::from_array(latent_chunk)])?;
			let decoded: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
			let decoded: Array4<f32> = decoded.view().to_owned().into_dimensionality()?;
			// NCHW -> NHWC, [-1, 1] -> [0, 1]
			let decoded = decoded.permuted_axes([0, 2, 3, 1]).as_standard_layout().to_owned() / 2.0 + 0.5;

			let image = self.to_image(decoded.shape()[2] as _, decoded.shape()[1] as _, &decoded)?;
			images.push(image);
		}

		Ok(images)
	}
}
