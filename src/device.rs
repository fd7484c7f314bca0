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

//! Device placement for the models of a pipeline.

use ort::ExecutionProvider;
use serde::{Deserialize, Serialize};

/// The strategy to use for extending the device memory arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Subsequent memory allocations extend by larger amounts (multiplied by powers of two)
	#[default]
	PowerOfTwo,
	/// Memory allocations extend only by the requested amount.
	SameAsRequested
}

impl ArenaExtendStrategy {
	fn as_ort_str(self) -> &'static str {
		match self {
			Self::PowerOfTwo => "kNextPowerOfTwo",
			Self::SameAsRequested => "kSameAsRequested"
		}
	}
}

/// The type of search done for cuDNN convolution algorithms.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CudnnConvolutionSearch {
	/// Exhaustive kernel search. Spends more time and memory up front to find the fastest kernel for this GPU.
	#[default]
	Exhaustive,
	/// Heuristic kernel search.
	Heuristic,
	/// Use the default cuDNN kernels, which may not be tuned for this GPU.
	///
	/// **NOTE**: anything other than `Exhaustive` is known to break float16 models.
	Default
}

impl CudnnConvolutionSearch {
	fn as_ort_str(self) -> &'static str {
		match self {
			Self::Exhaustive => "EXHAUSTIVE",
			Self::Heuristic => "HEURISTIC",
			Self::Default => "DEFAULT"
		}
	}
}

/// Options for the CUDA execution provider.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CudaDeviceOptions {
	/// The strategy to use for extending the device memory arena.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (i.e. per-model) memory limit in bytes. Without a limit a session may claim all free VRAM.
	pub memory_limit: Option<usize>,
	/// The type of search done for cuDNN convolution algorithms.
	pub cudnn_conv_algorithm_search: Option<CudnnConvolutionSearch>
}

impl CudaDeviceOptions {
	/// Settings for GPUs with little free memory: a 3 GB per-session limit with an arena that only grows by what is
	/// requested. Enough for the Stable Diffusion v1 UNet at 512x512.
	pub fn low_vram() -> Self {
		Self {
			arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested),
			memory_limit: Some(3_000_000_000),
			cudnn_conv_algorithm_search: None
		}
	}

	fn into_provider(self, device_id: usize) -> ExecutionProvider {
		let mut ep = ExecutionProvider::cuda().with("device_id", device_id.to_string());
		if let Some(strategy) = self.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", strategy.as_ort_str());
		}
		if let Some(memory_limit) = self.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		if let Some(search) = self.cudnn_conv_algorithm_search {
			ep = ep.with("cudnn_conv_algo_search", search.as_ort_str());
		}
		ep
	}
}

/// A device to place a model on.
///
/// If a configured execution provider is not available at runtime, ONNX Runtime places the model on the CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// The CPU. **This is the default device.**
	Cpu,
	/// An NVIDIA GPU through CUDA, with its device ID and optional provider tuning.
	Cuda(usize, Option<CudaDeviceOptions>),
	/// An NVIDIA GPU through TensorRT.
	TensorRt
}

impl DiffusionDevice {
	/// A short human-readable name, used in logs.
	pub fn describe(&self) -> String {
		match self {
			Self::Cpu => "CPU".to_string(),
			Self::Cuda(id, _) => format!("CUDA (device {id})"),
			Self::TensorRt => "TensorRT".to_string()
		}
	}
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::Cpu => ExecutionProvider::cpu(),
			DiffusionDevice::Cuda(device_id, options) => options.unwrap_or_default().into_provider(device_id),
			DiffusionDevice::TensorRt => ExecutionProvider::tensorrt()
		}
	}
}

/// Selects which device each model of the pipeline is placed on.
///
/// On GPUs with <6 GB of VRAM it can pay off to keep the text encoder and VAE decoder on the CPU and only move the
/// much heavier UNet to the GPU:
/// ```
/// use sd_imagegen::{DiffusionDevice, DiffusionDeviceControl};
///
/// let devices = DiffusionDeviceControl {
/// 	unet: DiffusionDevice::Cuda(0, None),
/// 	..Default::default()
/// };
/// assert_eq!(devices.text_encoder, DiffusionDevice::Cpu);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffusionDeviceControl {
	/// Device of the CLIP text encoder.
	pub text_encoder: DiffusionDevice,
	/// Device of the UNet.
	pub unet: DiffusionDevice,
	/// Device of the variational autoencoder decoder.
	pub vae_decoder: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Places every model on the same device.
	///
	/// A `memory_limit` in [`CudaDeviceOptions`] applies **per model**, not to the pipeline as a whole.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			text_encoder: device.clone(),
			unet: device.clone(),
			vae_decoder: device
		}
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		Self::all(DiffusionDevice::Cpu)
	}
}

/// A coarse device selection, as given on the command line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceChoice {
	/// CUDA if this build has CUDA support, otherwise the CPU.
	#[default]
	Auto,
	/// Always the CPU.
	Cpu,
	/// CUDA.
	Cuda,
	/// TensorRT.
	Tensorrt
}

impl DeviceChoice {
	/// Whether this build was compiled with the CUDA execution provider.
	pub const fn cuda_compiled() -> bool {
		cfg!(feature = "ort-cuda")
	}

	/// Resolves the choice into a concrete device.
	pub fn resolve(self, device_id: usize, low_vram: bool) -> DiffusionDevice {
		let cuda = || DiffusionDevice::Cuda(device_id, low_vram.then(CudaDeviceOptions::low_vram));
		match self {
			Self::Auto if Self::cuda_compiled() => cuda(),
			Self::Auto | Self::Cpu => DiffusionDevice::Cpu,
			Self::Cuda => cuda(),
			Self::Tensorrt => DiffusionDevice::TensorRt
		}
	}
}
