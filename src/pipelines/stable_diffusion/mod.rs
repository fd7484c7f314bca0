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

mod impl_main;
mod impl_txt2img;

pub use self::impl_main::StableDiffusionPipeline;
pub use self::impl_txt2img::Txt2ImgOptions;
use crate::DiffusionDeviceControl;

/// Options for the Stable Diffusion pipeline.
#[derive(Default, Debug, Clone)]
pub struct StableDiffusionOptions {
	/// A [`DiffusionDeviceControl`] object, mapping what device to place each model on.
	pub devices: DiffusionDeviceControl
}

/// Called after every denoising step with the number of completed steps and the total. Returning `false` stops the
/// run early; the latents at that point are still decoded.
pub type ProgressCallback<'a> = dyn FnMut(usize, usize) -> bool + 'a;
