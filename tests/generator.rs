use std::{
	cell::RefCell,
	rc::Rc,
	sync::{Arc, Mutex}
};

use image::{DynamicImage, Rgb32FImage};
use sd_imagegen::{GenerationRequest, GenerationSettings, ImageGenError, ImageGenerator, ProgressCallback, TextToImage};

/// Records every request and returns a flat gray image of the requested size.
#[derive(Default, Clone)]
struct MockModel {
	requests: Arc<Mutex<Vec<(String, u64)>>>,
	fail_on: Option<usize>,
	max_steps: Option<usize>
}

impl TextToImage for MockModel {
	fn validate(&self, settings: &GenerationSettings) -> anyhow::Result<()> {
		settings.validate()?;
		match self.max_steps {
			Some(max) if settings.steps > max => anyhow::bail!(ImageGenError::InvalidSettings {
				field: "steps",
				reason: format!("at most {max}")
			}),
			_ => Ok(())
		}
	}

	fn generate(&mut self, request: &GenerationRequest<'_>, progress: &mut ProgressCallback<'_>) -> anyhow::Result<DynamicImage> {
		let mut requests = self.requests.lock().unwrap();
		if self.fail_on == Some(requests.len() + 1) {
			anyhow::bail!("mock failure");
		}
		requests.push((request.prompt.to_string(), request.seed));
		for step in 1..=request.settings.steps {
			progress(step, request.settings.steps);
		}
		let (w, h) = (request.settings.width, request.settings.height);
		Ok(DynamicImage::ImageRgb32F(Rgb32FImage::from_pixel(w, h, image::Rgb([0.5, 0.5, 0.5]))))
	}
}

fn small_settings() -> GenerationSettings {
	GenerationSettings {
		width: 16,
		height: 8,
		steps: 3,
		..Default::default()
	}
}

#[test]
fn saves_numbered_pngs_named_after_prompt() {
	let dir = tempfile::tempdir().unwrap();
	let output_dir = dir.path().join("nested/generated_images");
	let mut generator = ImageGenerator::with_backend(small_settings(), MockModel::default());

	let saved = generator.generate_images("a cute robot, digital art", 3, &output_dir).unwrap();
	let names: Vec<_> = saved.iter().map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned()).collect();
	assert_eq!(names, ["a_cute_robot_digital_art_1.png", "a_cute_robot_digital_art_2.png", "a_cute_robot_digital_art_3.png"]);

	for image in &saved {
		let written = image::open(&image.path).unwrap();
		assert_eq!((written.width(), written.height()), (16, 8));
	}
}

#[test]
fn base_seed_increments_per_image() {
	let dir = tempfile::tempdir().unwrap();
	let model = MockModel::default();
	let settings = GenerationSettings { seed: Some(41), ..small_settings() };
	let mut generator = ImageGenerator::with_backend(settings, model.clone());

	let saved = generator.generate_images("fox", 3, dir.path()).unwrap();
	assert_eq!(saved.iter().map(|s| s.seed).collect::<Vec<_>>(), [41, 42, 43]);
	assert_eq!(model.requests.lock().unwrap().iter().map(|(_, seed)| *seed).collect::<Vec<_>>(), [41, 42, 43]);
}

#[test]
fn nothing_generated_before_loading() {
	let dir = tempfile::tempdir().unwrap();
	let mut generator = ImageGenerator::new(small_settings());
	assert!(!generator.is_loaded());

	let err = generator.generate_images("fox", 1, dir.path().join("out")).unwrap_err();
	assert!(matches!(err.downcast_ref::<ImageGenError>(), Some(ImageGenError::ModelNotLoaded)));
	assert!(!dir.path().join("out").exists());
}

#[test]
fn zero_images_is_an_error() {
	let dir = tempfile::tempdir().unwrap();
	let mut generator = ImageGenerator::with_backend(small_settings(), MockModel::default());
	let err = generator.generate_images("fox", 0, dir.path()).unwrap_err();
	assert!(matches!(err.downcast_ref::<ImageGenError>(), Some(ImageGenError::NoImagesRequested)));
}

#[test]
fn invalid_settings_are_rejected() {
	let dir = tempfile::tempdir().unwrap();
	let settings = GenerationSettings { width: 12, ..small_settings() };
	let mut generator = ImageGenerator::with_backend(settings, MockModel::default());
	let err = generator.generate_images("fox", 1, dir.path()).unwrap_err();
	assert!(matches!(err.downcast_ref::<ImageGenError>(), Some(ImageGenError::InvalidSettings { field: "width", .. })));
}

#[test]
fn model_limits_are_checked_before_output() {
	let dir = tempfile::tempdir().unwrap();
	let model = MockModel { max_steps: Some(2), ..Default::default() };
	let mut generator = ImageGenerator::with_backend(small_settings(), model.clone());

	let err = generator.generate_images("fox", 1, dir.path().join("out")).unwrap_err();
	assert!(matches!(err.downcast_ref::<ImageGenError>(), Some(ImageGenError::InvalidSettings { field: "steps", .. })));
	assert!(!dir.path().join("out").exists());
	assert!(model.requests.lock().unwrap().is_empty());
}

#[test]
fn clean_prompt_only_changes_model_input() {
	let dir = tempfile::tempdir().unwrap();
	let model = MockModel::default();
	let settings = GenerationSettings { clean_prompt: true, ..small_settings() };
	let mut generator = ImageGenerator::with_backend(settings, model.clone());

	let saved = generator.generate_images("fox,, forest ,", 1, dir.path()).unwrap();
	assert_eq!(model.requests.lock().unwrap()[0].0, "fox, forest");
	assert_eq!(saved[0].path, dir.path().join("fox_forest_1.png"));
}

#[test]
fn failure_keeps_earlier_images() {
	let dir = tempfile::tempdir().unwrap();
	let model = MockModel { fail_on: Some(2), ..Default::default() };
	let mut generator = ImageGenerator::with_backend(small_settings(), model);

	assert!(generator.generate_images("fox", 3, dir.path()).is_err());
	assert!(dir.path().join("fox_1.png").exists());
	assert!(!dir.path().join("fox_2.png").exists());
}

#[test]
fn progress_hook_sees_every_step() {
	let dir = tempfile::tempdir().unwrap();
	let steps = Rc::new(RefCell::new(Vec::new()));
	let mut generator = ImageGenerator::with_backend(small_settings(), MockModel::default());
	let seen = Rc::clone(&steps);
	generator.on_progress(move |step, total| seen.borrow_mut().push((step, total)));

	generator.generate_images("fox", 2, dir.path()).unwrap();
	assert_eq!(*steps.borrow(), [(1, 3), (2, 3), (3, 3), (1, 3), (2, 3), (3, 3)]);
}
