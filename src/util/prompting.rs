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

//! Utilities for tidying up prompts.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
	static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
	static ref COMMAS: Regex = Regex::new(r"\s*,[\s,]*").unwrap();
	static ref EDGE_COMMAS: Regex = Regex::new(r"^[,\s]+|[,\s]+$").unwrap();
}

/// Cleans up a potentially dirty prompt: collapses runs of whitespace and commas, puts a single space after each
/// comma, and strips leading and trailing commas.
///
/// ```
/// # use sd_imagegen::prompting::clean_prompt;
/// assert_eq!(clean_prompt("  a cute robot,,  digital art ,vibrant colors, "), "a cute robot, digital art, vibrant colors");
/// ```
pub fn clean_prompt<S: AsRef<str>>(prompt: S) -> String {
	let prompt = WHITESPACE.replace_all(prompt.as_ref(), " ");
	let prompt = COMMAS.replace_all(&prompt, ", ");
	EDGE_COMMAS.replace_all(&prompt, "").into_owned()
}

#[cfg(test)]
mod tests {
	use super::clean_prompt;

	#[test]
	fn test_clean_prompt() {
		assert_eq!(clean_prompt("sunset over a mountain lake,\nphotorealistic,,, highly detailed"), "sunset over a mountain lake, photorealistic, highly detailed");
		assert_eq!(clean_prompt(", ,watercolor painting ,"), "watercolor painting");
	}

	#[test]
	fn test_clean_prompt_keeps_clean_prompts() {
		let prompt = "futuristic cyberpunk city at night, neon lights, detailed buildings";
		assert_eq!(clean_prompt(prompt), prompt);
		assert_eq!(clean_prompt(""), "");
	}
}
