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

//! Diffusion pipelines.

use std::ops::Deref;

mod stable_diffusion;

pub use self::stable_diffusion::*;

/// Text prompt(s) used as input in diffusion pipelines. Each prompt produces one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt(pub(crate) Vec<String>);

impl Prompt {
	/// `batch_size` empty prompts, used as the unconditional input of classifier-free guidance.
	pub(crate) fn empty_batch(batch_size: usize) -> Self {
		Self(vec![String::new(); batch_size])
	}

	/// Repeats a single prompt to `batch_size`, or checks that the prompt already has that many entries.
	pub(crate) fn broadcast_to(&self, batch_size: usize) -> anyhow::Result<Self> {
		match self.0.len() {
			n if n == batch_size => Ok(self.clone()),
			1 => Ok(Self(vec![self.0[0].clone(); batch_size])),
			n => anyhow::bail!("expected 1 or {batch_size} negative prompts, got {n}")
		}
	}
}

impl Deref for Prompt {
	type Target = Vec<String>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<'s> From<&'s str> for Prompt {
	fn from(value: &'s str) -> Self {
		Self(vec![value.to_string()])
	}
}

impl From<String> for Prompt {
	fn from(value: String) -> Self {
		Self(vec![value])
	}
}

impl<'s> From<&'s [&'s str]> for Prompt {
	fn from(value: &'s [&'s str]) -> Self {
		Self(value.iter().map(|v| v.to_string()).collect())
	}
}

impl<'s> From<Vec<&'s str>> for Prompt {
	fn from(value: Vec<&'s str>) -> Self {
		Self(value.into_iter().map(str::to_string).collect())
	}
}

impl From<Vec<String>> for Prompt {
	fn from(value: Vec<String>) -> Self {
		Self(value)
	}
}

#[cfg(test)]
mod tests {
	use super::Prompt;

	#[test]
	fn broadcasts_single_prompt() {
		let negative = Prompt::from("blurry");
		assert_eq!(negative.broadcast_to(3).unwrap().len(), 3);
		assert!(Prompt::from(vec!["a", "b"]).broadcast_to(3).is_err());
		assert_eq!(Prompt::empty_batch(2).0, vec![String::new(), String::new()]);
	}
}
