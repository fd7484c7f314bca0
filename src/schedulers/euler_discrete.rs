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

use ndarray::{s, Array1, Array4, ArrayView1, ArrayView4};
use rand::RngCore;

use super::{alphas_cumprod, step_index, train_sigmas, DiffusionScheduler, SchedulerStepOutput};
use crate::{config::SchedulerConfig, util::interpolation::interp};

/// Inference timesteps spaced evenly over the train range, highest first, and their interpolated sigmas with a
/// trailing zero.
pub(super) fn karras_schedule(train_sigmas: &Array1<f32>, num_inference_steps: usize) -> (Array1<f32>, Array1<f32>) {
	let last = (train_sigmas.len() - 1) as f32;
	let timesteps = Array1::linspace(0.0, last, num_inference_steps).slice(s![..;-1]).to_owned();

	let xp = Array1::range(0.0, train_sigmas.len() as f32, 1.0);
	let mut sigmas = Array1::zeros(num_inference_steps + 1);
	for (sigma, &t) in sigmas.iter_mut().zip(timesteps.iter()) {
		*sigma = interp(t, xp.view(), train_sigmas.view());
	}
	(timesteps, sigmas)
}

/// Euler scheduler (Algorithm 2) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
	train_sigmas: Array1<f32>,
	sigmas: Array1<f32>,
	timesteps: Array1<f32>
}

impl EulerDiscreteScheduler {
	/// Creates a new instance of the scheduler for the given noise schedule.
	pub fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
		let train_sigmas = train_sigmas(&alphas_cumprod(config)?);
		let (timesteps, sigmas) = karras_schedule(&train_sigmas, config.num_train_timesteps);
		Ok(Self { train_sigmas, sigmas, timesteps })
	}

	fn sigma_at(&self, timestep: f32) -> (usize, f32) {
		let index = step_index(&self.timesteps, timestep);
		(index, self.sigmas[index])
	}
}

impl DiffusionScheduler for EulerDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		let (timesteps, sigmas) = karras_schedule(&self.train_sigmas, num_inference_steps);
		self.timesteps = timesteps;
		self.sigmas = sigmas;
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.sigmas.iter().copied().fold(0.0, f32::max)
	}

	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the K-LMS algorithm.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		let (_, sigma) = self.sigma_at(timestep);
		&sample / (sigma.powi(2) + 1.0).sqrt()
	}

	fn step(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, _rng: &mut dyn RngCore) -> SchedulerStepOutput {
		let (index, sigma) = self.sigma_at(timestep);

		// x_0 from sigma-scaled predicted noise; the ODE derivative is then the noise itself
		let pred_original_sample = &sample - &(&model_output * sigma);
		let derivative = (&sample - &pred_original_sample) / sigma;
		let dt = self.sigmas[index + 1] - sigma;
		let prev_sample = &sample + &(derivative * dt);

		SchedulerStepOutput { prev_sample }
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	#[test]
	fn timesteps_span_train_range() {
		let mut scheduler = EulerDiscreteScheduler::new(&SchedulerConfig::default()).unwrap();
		scheduler.set_timesteps(20);
		let timesteps = scheduler.timesteps();
		assert_eq!(timesteps.len(), 20);
		assert_eq!(timesteps[0], 999.0);
		assert_eq!(timesteps[19], 0.0);
		assert_eq!(scheduler.sigmas.len(), 21);
		assert_eq!(scheduler.sigmas[20], 0.0);
	}

	#[test]
	fn init_noise_sigma_matches_stable_diffusion() {
		let mut scheduler = EulerDiscreteScheduler::new(&SchedulerConfig::default()).unwrap();
		scheduler.set_timesteps(20);
		assert!((scheduler.init_noise_sigma() - 14.6146).abs() < 1e-2, "{}", scheduler.init_noise_sigma());
	}

	#[test]
	fn zero_noise_keeps_sample() {
		let mut scheduler = EulerDiscreteScheduler::new(&SchedulerConfig::default()).unwrap();
		scheduler.set_timesteps(10);
		let t = scheduler.timesteps()[3];
		let sample = Array4::from_elem((1, 4, 2, 2), 0.5_f32);
		let eps = Array4::zeros((1, 4, 2, 2));
		let out = scheduler.step(eps.view(), t, sample.view(), &mut StdRng::seed_from_u64(0));
		assert!(out.prev_sample().iter().all(|&v| (v - 0.5).abs() < 1e-6));
	}

	#[test]
	fn scales_by_sigma() {
		let mut scheduler = EulerDiscreteScheduler::new(&SchedulerConfig::default()).unwrap();
		scheduler.set_timesteps(20);
		let sigma = scheduler.sigmas[0];
		let sample = Array4::from_elem((1, 4, 1, 1), 1.0_f32);
		let scaled = scheduler.scale_model_input(sample.view(), 999.0);
		assert!((scaled[[0, 0, 0, 0]] - 1.0 / (sigma * sigma + 1.0).sqrt()).abs() < 1e-6);
	}
}
