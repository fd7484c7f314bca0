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

//! Naming and writing generated images.

use std::path::{Path, PathBuf};

use anyhow::Context;
use image::{DynamicImage, ImageFormat};
use lazy_static::lazy_static;
use regex::Regex;

const SLUG_MAX_CHARS: usize = 30;

lazy_static! {
	static ref UNSAFE_CHARS: Regex = Regex::new(r"[^\p{L}\p{N} _\-]").unwrap();
}

/// Turns a prompt into a file-name-safe stem.
///
/// Keeps letters and numbers (Unicode categories `L` and `N`; combining marks are dropped), spaces, `-` and `_`.
/// Trailing spaces are dropped before the result is cut to 30 characters. Spaces then become underscores.
///
/// ```
/// # use sd_imagegen::output::prompt_slug;
/// assert_eq!(prompt_slug("A cute robot, digital art!"), "A_cute_robot_digital_art");
/// ```
pub fn prompt_slug(prompt: &str) -> String {
	let kept = UNSAFE_CHARS.replace_all(prompt, "");
	kept.trim_end().chars().take(SLUG_MAX_CHARS).collect::<String>().replace(' ', "_")
}

/// Path of the `index`th (1-based) image generated for `prompt`: `dir/{slug}_{index}.png`.
pub fn image_path(dir: &Path, prompt: &str, index: usize) -> PathBuf {
	dir.join(format!("{}_{index}.png", prompt_slug(prompt)))
}

/// Writes `image` as an 8-bit RGB PNG, replacing any existing file.
pub fn save_png(image: &DynamicImage, path: &Path) -> anyhow::Result<()> {
	image
		.to_rgb8()
		.save_with_format(path, ImageFormat::Png)
		.with_context(|| format!("failed to save image to {}", path.display()))
}

#[cfg(test)]
mod tests {
	use image::{Rgb32FImage, RgbImage};

	use super::*;

	#[test]
	fn slug_drops_punctuation() {
		assert_eq!(prompt_slug("sunset over a mountain lake, photorealistic"), "sunset_over_a_mountain_lake_ph");
		assert_eq!(prompt_slug("neon-lit city_street!!"), "neon-lit_city_street");
	}

	#[test]
	fn slug_cuts_after_stripping() {
		// the cut can land on a space, which then becomes an underscore
		assert_eq!(prompt_slug(&format!("{} bbb", "a".repeat(29))), format!("{}_", "a".repeat(29)));
		assert_eq!(prompt_slug("short   "), "short");
		assert_eq!(prompt_slug("??"), "");
	}

	#[test]
	fn slug_keeps_unicode_letters() {
		assert_eq!(prompt_slug("富士山の夜景, 4k"), "富士山の夜景_4k");
		assert_eq!(prompt_slug("café à l'aube"), "café_à_laube");
	}

	#[test]
	fn slug_drops_combining_marks() {
		assert_eq!(prompt_slug("नमस्ते दुनिया"), "नमसत_दनय");
	}

	#[test]
	fn paths_are_one_based() {
		let path = image_path(Path::new("out"), "a red fox", 1);
		assert_eq!(path, Path::new("out").join("a_red_fox_1.png"));
	}

	#[test]
	fn saves_rgb8_png() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("gray_1.png");
		let image = DynamicImage::ImageRgb32F(Rgb32FImage::from_pixel(8, 4, image::Rgb([0.5, 0.5, 0.5])));
		save_png(&image, &path).unwrap();
		save_png(&image, &path).unwrap();

		let written: RgbImage = image::open(&path).unwrap().into_rgb8();
		assert_eq!(written.dimensions(), (8, 4));
	}
}
