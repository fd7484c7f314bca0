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

use std::collections::VecDeque;

use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use rand::RngCore;

use super::{alphas_cumprod, DiffusionScheduler, SchedulerStepOutput};
use crate::config::SchedulerConfig;

/// Pseudo numerical methods for diffusion models ([Liu et al. (2022)](https://arxiv.org/abs/2202.09778)), run as
/// the pseudo linear multistep (PLMS) method with the Runge-Kutta warmup skipped, the way Stable Diffusion v1 is
/// usually sampled.
///
/// The multistep update keeps up to four previous noise predictions. The first step is visited twice so that the
/// second order update has a predecessor to work with.
#[derive(Debug, Clone)]
pub struct PndmScheduler {
	alphas_cumprod: Array1<f32>,
	final_alpha_cumprod: f32,
	num_train_timesteps: usize,
	steps_offset: usize,
	num_inference_steps: usize,
	timesteps: Array1<f32>,
	ets: VecDeque<Array4<f32>>,
	cur_sample: Option<Array4<f32>>,
	counter: usize
}

impl PndmScheduler {
	/// Creates a new instance of the scheduler for the given noise schedule.
	pub fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
		let alphas_cumprod = alphas_cumprod(config)?;
		let final_alpha_cumprod = if config.set_alpha_to_one { 1.0 } else { alphas_cumprod[0] };
		let mut scheduler = Self {
			alphas_cumprod,
			final_alpha_cumprod,
			num_train_timesteps: config.num_train_timesteps,
			steps_offset: config.steps_offset,
			num_inference_steps: 0,
			timesteps: Array1::zeros(0),
			ets: VecDeque::with_capacity(4),
			cur_sample: None,
			counter: 0
		};
		scheduler.set_timesteps(config.num_train_timesteps);
		Ok(scheduler)
	}

	fn step_ratio(&self) -> isize {
		(self.num_train_timesteps / self.num_inference_steps.max(1)) as isize
	}

	fn alpha_prod(&self, timestep: isize) -> f32 {
		match usize::try_from(timestep) {
			Ok(t) => self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)],
			Err(_) => self.final_alpha_cumprod
		}
	}

	/// Formula (9) of the paper: moves `sample` from `timestep` to `prev_timestep` along the predicted noise.
	fn prev_sample(&self, sample: ArrayView4<'_, f32>, timestep: isize, prev_timestep: isize, eps: &Array4<f32>) -> Array4<f32> {
		let alpha_prod_t = self.alpha_prod(timestep);
		let alpha_prod_t_prev = self.alpha_prod(prev_timestep);
		let beta_prod_t = 1.0 - alpha_prod_t;
		let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

		let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
		let eps_denom_coeff = alpha_prod_t * beta_prod_t_prev.sqrt() + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();

		&sample * sample_coeff - eps * ((alpha_prod_t_prev - alpha_prod_t) / eps_denom_coeff)
	}
}

impl DiffusionScheduler for PndmScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.num_inference_steps = num_inference_steps.clamp(1, self.num_train_timesteps);
		let ratio = self.num_train_timesteps / self.num_inference_steps;
		let last = self.num_train_timesteps - 1;
		let ascending: Vec<usize> = (0..self.num_inference_steps).map(|i| (i * ratio + self.steps_offset).min(last)).collect();

		// repeat the second-to-last timestep so the second PLMS step can reuse the first model output
		let mut timesteps: Vec<usize> = Vec::with_capacity(ascending.len() + 1);
		timesteps.extend(ascending.iter().rev().take(1));
		timesteps.extend(ascending.iter().rev().skip(1).take(1));
		timesteps.extend(ascending.iter().rev().skip(1));
		self.timesteps = timesteps.into_iter().map(|t| t as f32).collect();

		self.ets.clear();
		self.cur_sample = None;
		self.counter = 0;
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		1.0
	}

	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, _timestep: f32) -> Array4<f32> {
		sample.to_owned()
	}

	fn step(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, _rng: &mut dyn RngCore) -> SchedulerStepOutput {
		let mut timestep = timestep as isize;
		let mut prev_timestep = timestep - self.step_ratio();

		if self.counter == 1 {
			// second visit of the first timestep
			prev_timestep = timestep;
			timestep += self.step_ratio();
		} else {
			if self.ets.len() == 4 {
				self.ets.pop_front();
			}
			self.ets.push_back(model_output.to_owned());
		}

		let mut sample = sample.to_owned();
		let ets = &self.ets;
		let eps = match ets.len() {
			1 if self.counter == 0 => {
				self.cur_sample = Some(sample.clone());
				model_output.to_owned()
			}
			1 => {
				if let Some(cur_sample) = self.cur_sample.take() {
					sample = cur_sample;
				}
				(&model_output + &ets[0]) / 2.0
			}
			2 => (&ets[1] * 3.0 - &ets[0]) / 2.0,
			3 => (&ets[2] * 23.0 - &ets[1] * 16.0 + &ets[0] * 5.0) / 12.0,
			_ => (&ets[3] * 55.0 - &ets[2] * 59.0 + &ets[1] * 37.0 - &ets[0] * 9.0) / 24.0
		};

		let prev_sample = self.prev_sample(sample.view(), timestep, prev_timestep, &eps);
		self.counter += 1;

		SchedulerStepOutput { prev_sample }
	}
}

#[cfg(test)]
mod tests {
	use rand::{rngs::StdRng, SeedableRng};

	use super::*;

	fn scheduler(steps: usize) -> PndmScheduler {
		let mut scheduler = PndmScheduler::new(&SchedulerConfig::default()).unwrap();
		scheduler.set_timesteps(steps);
		scheduler
	}

	#[test]
	fn plms_timesteps_repeat_the_first_step() {
		let scheduler = scheduler(20);
		let timesteps = scheduler.timesteps();
		assert_eq!(timesteps.len(), 21);
		assert_eq!(&timesteps.as_slice().unwrap()[..4], &[951.0, 901.0, 901.0, 851.0]);
		assert_eq!(timesteps[20], 1.0);
	}

	#[test]
	fn zero_noise_rescales_sample() {
		let mut scheduler = scheduler(20);
		let sample = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
		let eps = Array4::zeros((1, 4, 2, 2));
		let out = scheduler.step(eps.view(), 951.0, sample.view(), &mut StdRng::seed_from_u64(0));

		let expected = (scheduler.alphas_cumprod[901] / scheduler.alphas_cumprod[951]).sqrt();
		assert!(out.prev_sample().iter().all(|&v| (v - expected).abs() < 1e-5));
	}

	#[test]
	fn second_step_restarts_from_first_sample() {
		let mut scheduler = scheduler(20);
		let mut rng = StdRng::seed_from_u64(0);
		let sample = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
		let eps = Array4::from_elem((1, 4, 2, 2), 0.1_f32);

		let first = scheduler.step(eps.view(), 951.0, sample.view(), &mut rng).into_prev_sample();
		// the sample passed to the second step is ignored in favour of the first step's input
		let second = scheduler.step(eps.view(), 901.0, first.view(), &mut rng).into_prev_sample();
		let mut fresh = self::scheduler(20);
		let direct = fresh.step(eps.view(), 951.0, sample.view(), &mut rng).into_prev_sample();

		assert_eq!(scheduler.ets.len(), 1);
		assert!(second.iter().zip(direct.iter()).all(|(a, b)| (a - b).abs() < 1e-6));
	}

	#[test]
	fn one_step_per_train_timestep_stays_in_range() {
		for steps in [1000, 1500] {
			let mut scheduler = scheduler(steps);
			let timesteps = scheduler.timesteps().to_vec();
			assert_eq!(timesteps.len(), 1001);
			assert!(timesteps.iter().all(|&t| t < 1000.0), "{steps}: {:?}", &timesteps[..3]);

			let mut rng = StdRng::seed_from_u64(0);
			let mut sample = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
			let eps = Array4::from_elem((1, 4, 2, 2), 0.01_f32);
			for t in timesteps {
				sample = scheduler.step(eps.view(), t, sample.view(), &mut rng).into_prev_sample();
			}
			assert!(sample.iter().all(|v| v.is_finite()));
		}
	}

	#[test]
	fn keeps_at_most_four_predictions() {
		let mut scheduler = scheduler(10);
		let mut rng = StdRng::seed_from_u64(0);
		let mut sample = Array4::from_elem((1, 4, 2, 2), 1.0_f32);
		let eps = Array4::from_elem((1, 4, 2, 2), 0.01_f32);
		for t in scheduler.timesteps().to_vec() {
			sample = scheduler.step(eps.view(), t, sample.view(), &mut rng).into_prev_sample();
		}
		assert_eq!(scheduler.ets.len(), 4);
		assert!(sample.iter().all(|v| v.is_finite()));
	}
}
