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

//! Schedulers take the output of a trained model, the sample the diffusion process is iterating on, and a timestep,
//! and return a less noisy sample.
//!
//! For inference, a scheduler defines how to update a sample from the output of a pretrained model. Schedulers are
//! usually defined by a noise schedule and an update rule solving the underlying differential equation.

use std::fmt::{self, Display};

use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{BetaSchedule, SchedulerConfig};

mod euler_ancestral_discrete;
mod euler_discrete;
mod pndm;

pub use self::euler_ancestral_discrete::EulerAncestralDiscreteScheduler;
pub use self::euler_discrete::EulerDiscreteScheduler;
pub use self::pndm::PndmScheduler;

/// The output returned by a scheduler's `step` function.
#[derive(Debug, Clone)]
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep; the next model input of the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// Takes ownership of the previous sample.
	pub fn into_prev_sample(self) -> Array4<f32> {
		self.prev_sample
	}
}

/// A scheduler to be used in diffusion pipelines.
pub trait DiffusionScheduler {
	/// Sets the number of inference steps. Must be called before `step`.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Returns the timesteps computed by the last call to `set_timesteps`, in the order they are visited.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// Returns the standard deviation of the initial noise.
	fn init_noise_sigma(&self) -> f32;

	/// Scales the denoising model input as this scheduler's update rule expects.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32>;

	/// Predicts the sample at the previous timestep from the model output (the predicted noise).
	fn step(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut dyn RngCore) -> SchedulerStepOutput;
}

/// The samplers available to the generator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
	/// Pseudo linear multistep; the default sampler of Stable Diffusion v1.5.
	#[default]
	Pndm,
	/// Euler method (Karras et al.).
	Euler,
	/// Euler method with ancestral noise.
	EulerAncestral
}

impl SchedulerKind {
	/// Builds a scheduler of this kind for the given noise schedule.
	pub fn build(self, config: &SchedulerConfig) -> anyhow::Result<Box<dyn DiffusionScheduler>> {
		Ok(match self {
			Self::Pndm => Box::new(PndmScheduler::new(config)?),
			Self::Euler => Box::new(EulerDiscreteScheduler::new(config)?),
			Self::EulerAncestral => Box::new(EulerAncestralDiscreteScheduler::new(config)?)
		})
	}
}

impl Display for SchedulerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Pndm => "PNDM",
			Self::Euler => "Euler",
			Self::EulerAncestral => "Euler ancestral"
		})
	}
}

/// Computes the cumulative product of alphas (`1 - beta`) over the train timesteps.
///
/// # Errors
/// - `num_train_timesteps` is 0
/// - `beta_start` or `beta_end` are not normal numbers (zero, infinite, `NaN`, or subnormal)
/// - `beta_end` is less than or equal to `beta_start`
pub(crate) fn alphas_cumprod(config: &SchedulerConfig) -> anyhow::Result<Array1<f32>> {
	let SchedulerConfig { num_train_timesteps, beta_start, beta_end, .. } = *config;
	if num_train_timesteps == 0 {
		anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >0");
	}
	if !beta_start.is_normal() || !beta_end.is_normal() {
		anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
	}
	if beta_start >= beta_end {
		anyhow::bail!("beta_start ({beta_start}) must be < beta_end ({beta_end})");
	}

	let betas = match config.beta_schedule {
		BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
		BetaSchedule::ScaledLinear => Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps).mapv_into(|b| b * b)
	};

	Ok(betas
		.iter()
		.scan(1.0_f32, |prod, beta| {
			*prod *= 1.0 - beta;
			Some(*prod)
		})
		.collect())
}

/// Karras sigmas `sqrt((1 - ᾱ) / ᾱ)` for every train timestep.
pub(crate) fn train_sigmas(alphas_cumprod: &Array1<f32>) -> Array1<f32> {
	alphas_cumprod.mapv(|a| ((1.0 - a) / a).sqrt())
}

/// Position of `timestep` in `timesteps`.
///
/// # Panics
/// Panics if the timestep was not produced by the scheduler's `set_timesteps`.
pub(crate) fn step_index(timesteps: &Array1<f32>, timestep: f32) -> usize {
	match timesteps.iter().position(|&t| t == timestep) {
		Some(index) => index,
		None => panic!("timestep {timestep} is not one of this scheduler's timesteps; was `set_timesteps` called?")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alphas_cumprod_decreases() {
		let acp = alphas_cumprod(&SchedulerConfig::default()).unwrap();
		assert_eq!(acp.len(), 1000);
		assert!((acp[0] - (1.0 - 0.00085)).abs() < 1e-6);
		assert!(acp.windows(2).into_iter().all(|w| w[1] < w[0]));
	}

	#[test]
	fn rejects_bad_beta_ranges() {
		let config = SchedulerConfig { beta_start: 0.02, beta_end: 0.01, ..Default::default() };
		assert!(alphas_cumprod(&config).is_err());
		let config = SchedulerConfig { num_train_timesteps: 0, ..Default::default() };
		assert!(alphas_cumprod(&config).is_err());
	}

	#[test]
	fn every_kind_builds() {
		for kind in [SchedulerKind::Pndm, SchedulerKind::Euler, SchedulerKind::EulerAncestral] {
			let mut scheduler = kind.build(&SchedulerConfig::default()).unwrap();
			scheduler.set_timesteps(20);
			assert!(scheduler.timesteps().len() >= 20, "{kind}");
		}
	}
}
