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

use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::RngCore;

use super::{alphas_cumprod, euler_discrete::karras_schedule, step_index, train_sigmas, DiffusionScheduler, SchedulerStepOutput};
use crate::config::SchedulerConfig;

/// Ancestral sampling with Euler method steps.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd]. Every step adds fresh noise, so
/// results depend on the RNG passed to `step`.
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
#[derive(Debug, Clone)]
pub struct EulerAncestralDiscreteScheduler {
	train_sigmas: Array1<f32>,
	sigmas: Array1<f32>,
	timesteps: Array1<f32>
}

impl EulerAncestralDiscreteScheduler {
	/// Creates a new instance of the scheduler for the given noise schedule.
	pub fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
		let train_sigmas = train_sigmas(&alphas_cumprod(config)?);
		let (timesteps, sigmas) = karras_schedule(&train_sigmas, config.num_train_timesteps);
		Ok(Self { train_sigmas, sigmas, timesteps })
	}
}

impl DiffusionScheduler for EulerAncestralDiscreteScheduler {
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

	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
		let sigma = self.sigmas[step_index(&self.timesteps, timestep)];
		&sample / (sigma.powi(2) + 1.0).sqrt()
	}

	fn step(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut dyn RngCore) -> SchedulerStepOutput {
		let index = step_index(&self.timesteps, timestep);
		let sigma_from = self.sigmas[index];
		let sigma_to = self.sigmas[index + 1];

		let pred_original_sample = &sample - &(&model_output * sigma_from);
		let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt();
		let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).sqrt();

		let derivative = (&sample - &pred_original_sample) / sigma_from;
		let dt = sigma_down - sigma_from;
		let noise = Array4::<f32>::random_using(model_output.raw_dim(), StandardNormal, rng);
		let prev_sample = &sample + &(derivative * dt) + noise * sigma_up;

		SchedulerStepOutput { prev_sample }
	}
}

#[cfg(test)]
mod tests {
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	#[test]
	fn last_step_adds_no_noise() {
		let mut scheduler = EulerAncestralDiscreteScheduler::new(&SchedulerConfig::default()).unwrap();
		scheduler.set_timesteps(5);
		let t = scheduler.timesteps()[4];
		let sample = Array4::from_elem((1, 4, 2, 2), 0.25_f32);
		let eps = Array4::zeros((1, 4, 2, 2));
		let out = scheduler.step(eps.view(), t, sample.view(), &mut StdRng::seed_from_u64(7));
		assert!(out.prev_sample().iter().all(|&v| (v - 0.25).abs() < 1e-6));
	}

	#[test]
	fn same_seed_same_result() {
		let run = |seed| {
			let mut scheduler = EulerAncestralDiscreteScheduler::new(&SchedulerConfig::default()).unwrap();
			scheduler.set_timesteps(5);
			let t = scheduler.timesteps()[0];
			let sample = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
			let eps = Array4::from_elem((1, 4, 2, 2), 0.1_f32);
			scheduler.step(eps.view(), t, sample.view(), &mut StdRng::seed_from_u64(seed)).into_prev_sample()
		};
		assert_eq!(run(3), run(3));
		assert_ne!(run(3), run(4));
	}
}
