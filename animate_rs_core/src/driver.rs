//! The per-pair sample loop: seed setup, input loading, preprocessing, one
//! pipeline invocation, and artifact writing.
//!
//! The driver is generic over [`FrameGenerator`] so the control flow can be
//! exercised without any model weights.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use image::RgbImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

use animate_rs_common::{raster, video};

use crate::config::{AnimationConfig, SeedRecord, SEED_SENTINEL};
use crate::dist::DistContext;
use crate::pipelines::{FrameGenerator, GenerationParams, GenerationRequest};

/// The grid "video" holds one comparison frame, not real motion.
const GRID_FPS: u32 = 1;
const INDIVIDUAL_FPS: u32 = 8;
const NEUTRAL_PROMPT: &str = "none";

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Turn a configured seed into the seed actually used: the sentinel draws a
/// fresh nondeterministic seed, anything else passes through.
pub fn realize_seed(configured: i64) -> u64 {
    if configured == SEED_SENTINEL {
        rand::thread_rng().gen()
    } else {
        configured as u64
    }
}

/// Edge-pad a frame sequence by repeating its final frame until the length
/// is a multiple of `stride`.
pub fn pad_to_stride(mut frames: Vec<RgbImage>, stride: usize) -> Vec<RgbImage> {
    if stride == 0 {
        return frames;
    }
    if let Some(last) = frames.last().cloned() {
        let rem = frames.len() % stride;
        if rem != 0 {
            for _ in 0..stride - rem {
                frames.push(last.clone());
            }
        }
    }
    frames
}

/// Output directory name for a (source, video) pair, derived from the two
/// input basenames.
pub fn pair_dir_name(source: &Path, video: &Path) -> String {
    fn stem(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string())
    }
    format!("{}_{}", stem(source), stem(video))
}

/// Decode the driving condition: every frame of a video, or a single-frame
/// sequence for a still image. Frames are resized to `size` when they
/// differ, and the `[offset, offset + max_length)` window is applied before
/// any padding.
pub fn load_condition_frames(
    path: &Path,
    size: u32,
    offset: usize,
    max_length: Option<usize>,
) -> Result<Vec<RgbImage>> {
    let frames = if is_video_path(path) {
        video::read_video_frames(path)?
    } else {
        vec![raster::load_image(path)?]
    };
    let mut frames: Vec<_> = frames
        .into_iter()
        .map(|f| raster::resize_square(&f, size))
        .collect();
    if let Some(max_length) = max_length {
        let start = offset.min(frames.len());
        let end = (offset + max_length).min(frames.len());
        frames = frames[start..end].to_vec();
    }
    anyhow::ensure!(
        !frames.is_empty(),
        "driving condition {} has no frames left after the [{}, {}) window",
        path.display(),
        offset,
        offset + max_length.unwrap_or(0),
    );
    Ok(frames)
}

/// Load the source as a still image; a video source contributes its first
/// frame.
pub fn load_source_image(path: &Path, size: u32) -> Result<RgbImage> {
    let image = if is_video_path(path) {
        let frames = video::read_video_frames(path)?;
        frames
            .into_iter()
            .next()
            .with_context(|| format!("source video {} has no frames", path.display()))?
    } else {
        raster::load_image(path)?
    };
    Ok(raster::resize_square(&image, size))
}

pub struct SampleDriver<G> {
    config: AnimationConfig,
    save_dir: PathBuf,
    generator: G,
    dist: Option<DistContext>,
}

impl<G: FrameGenerator> SampleDriver<G> {
    pub fn new(config: AnimationConfig, save_dir: PathBuf, generator: G) -> Self {
        Self {
            config,
            save_dir,
            generator,
            dist: None,
        }
    }

    pub fn with_dist(mut self, ctx: DistContext) -> Self {
        self.dist = Some(ctx);
        self
    }

    fn rank(&self) -> usize {
        self.dist.as_ref().map_or(0, |d| d.rank())
    }

    /// Process every configured (source, video) pair, then persist the
    /// config snapshot with the realized seeds. Only rank 0 writes.
    pub fn run(mut self) -> Result<SeedRecord> {
        let seeds = self.config.resolved_seeds();
        let pairs: Vec<(PathBuf, PathBuf)> = self
            .config
            .source_image
            .iter()
            .cloned()
            .zip(self.config.video_path.iter().cloned())
            .collect();
        let mut record = SeedRecord::default();

        for (idx, (source_path, video_path)) in pairs.iter().enumerate() {
            info!(
                "pair {}/{}: {} + {}",
                idx + 1,
                pairs.len(),
                source_path.display(),
                video_path.display()
            );

            // SeedSetup
            let seed = realize_seed(seeds[idx]);
            let mut rng = StdRng::seed_from_u64(seed);
            self.generator.set_seed(seed)?;
            record.push(seed);
            info!("current seed: {seed}");

            // LoadInputs
            let size = self.config.size as u32;
            let control = load_condition_frames(
                video_path,
                size,
                self.config.offset,
                self.config.max_length,
            )?;
            let source_image = load_source_image(source_path, size)?;

            // Preprocess
            let control = pad_to_stride(control, self.config.stride);
            let pick = rng.gen_range(0..control.len());
            let pose_condition = control[pick].clone();

            // Invoke
            let request = GenerationRequest {
                prompt: NEUTRAL_PROMPT.to_string(),
                negative_prompt: NEUTRAL_PROMPT.to_string(),
                source_image,
                pose_condition,
                params: GenerationParams {
                    steps: self.config.steps,
                    num_actual_inference_steps: self.config.num_actual_inference_steps,
                    guidance_scale: self.config.guidance_scale,
                },
            };
            let sample = self.generator.generate(&request)?;

            // PostprocessAndSave
            if self.rank() == 0 {
                self.save_pair_outputs(
                    source_path,
                    video_path,
                    &request.source_image,
                    &request.pose_condition,
                    &sample,
                )?;
            }

            // Barrier
            if let Some(ctx) = &mut self.dist {
                ctx.barrier()?;
            }
        }

        if self.rank() == 0 {
            let snapshot = self.config.snapshot(&record)?;
            let path = self.save_dir.join("config.yaml");
            fs::write(&path, snapshot)
                .with_context(|| format!("cannot write config snapshot {}", path.display()))?;
        }
        Ok(record)
    }

    fn save_pair_outputs(
        &self,
        source_path: &Path,
        video_path: &Path,
        source_image: &RgbImage,
        pose_condition: &RgbImage,
        sample: &Tensor,
    ) -> Result<()> {
        let (_b, _h, _w, c) = sample.dims4()?;
        anyhow::ensure!(c == 3, "expected a (1, H, W, 3) sample, got {:?}", sample.dims());

        let device = Device::Cpu;
        let source_t = raster::image_to_video_tensor(source_image, &device)?;
        let control_t = raster::image_to_video_tensor(pose_condition, &device)?;
        let sample_t = sample.to_device(&device)?.permute((0, 3, 1, 2))?.unsqueeze(2)?;

        // source | condition | generated, stacked along batch.
        let grid = Tensor::cat(&[&source_t, &control_t, &sample_t], 0)?;

        let dir = self
            .save_dir
            .join("videos")
            .join(pair_dir_name(source_path, video_path));
        let grid_video = dir.join("grid.mp4");
        video::write_video_grid(&grid, &grid_video, GRID_FPS)?;

        // Thumbnail comes from re-decoding what was actually written.
        let frames = video::read_video_frames(&grid_video)?;
        let first = frames
            .first()
            .with_context(|| format!("no frames decoded back from {}", grid_video.display()))?;
        first.save(dir.join("grid.png"))?;

        if self.config.save_individual_videos {
            video::write_video_grid(&grid.narrow(0, 1, 1)?, &dir.join("ctrl.mp4"), INDIVIDUAL_FPS)?;
            video::write_video_grid(&grid.narrow(0, 0, 1)?, &dir.join("orig.mp4"), INDIVIDUAL_FPS)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8) -> RgbImage {
        RgbImage::from_pixel(8, 8, image::Rgb([value, value, value]))
    }

    #[test]
    fn padding_reaches_a_stride_multiple() {
        let frames: Vec<_> = (0..20).map(|i| frame(i as u8)).collect();
        let padded = pad_to_stride(frames, 16);
        assert_eq!(padded.len(), 32);
    }

    #[test]
    fn padding_repeats_the_final_frame() {
        let frames: Vec<_> = (0..5).map(|i| frame(i as u8 * 10)).collect();
        let padded = pad_to_stride(frames, 4);
        assert_eq!(padded.len(), 8);
        for extra in &padded[5..] {
            assert_eq!(extra.as_raw(), padded[4].as_raw());
        }
    }

    #[test]
    fn exact_multiple_is_untouched() {
        let frames: Vec<_> = (0..16).map(|i| frame(i as u8)).collect();
        assert_eq!(pad_to_stride(frames, 16).len(), 16);
    }

    #[test]
    fn zero_stride_is_a_no_op() {
        let frames: Vec<_> = (0..3).map(|i| frame(i as u8)).collect();
        assert_eq!(pad_to_stride(frames, 0).len(), 3);
    }

    #[test]
    fn condition_pick_is_in_range_and_reproducible() {
        let padded_len = 32;
        let mut rng = StdRng::seed_from_u64(42);
        let first = rng.gen_range(0..padded_len);
        assert!(first < padded_len);
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(rng.gen_range(0..padded_len), first);
    }

    #[test]
    fn pair_dir_names_come_from_basenames() {
        assert_eq!(
            pair_dir_name(Path::new("data/alice.png"), Path::new("clips/dance.mp4")),
            "alice_dance"
        );
    }

    #[test]
    fn realized_seed_passes_through_configured_values() {
        assert_eq!(realize_seed(42), 42);
        assert_eq!(realize_seed(0), 0);
    }

    #[test]
    fn sentinel_draws_fresh_seeds() {
        // Astronomically unlikely to collide 8 times in a row.
        let draws: Vec<u64> = (0..8).map(|_| realize_seed(SEED_SENTINEL)).collect();
        let all_equal = draws.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal);
    }

    #[test]
    fn video_path_detection() {
        assert!(is_video_path(Path::new("clip.mp4")));
        assert!(is_video_path(Path::new("CLIP.MP4")));
        assert!(!is_video_path(Path::new("ref.png")));
    }

    #[test]
    fn still_image_condition_is_a_single_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pose.png");
        frame(128).save(&path).unwrap();
        let frames = load_condition_frames(&path, 8, 0, None).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn window_is_applied_before_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pose.png");
        frame(128).save(&path).unwrap();
        // offset beyond the sequence leaves nothing; fatal, not a panic.
        let err = load_condition_frames(&path, 8, 5, Some(2)).unwrap_err();
        assert!(err.to_string().contains("no frames left"));
    }

    #[test]
    fn missing_condition_path_is_fatal_with_path() {
        let err = load_condition_frames(Path::new("/nonexistent/pose.png"), 8, 0, None)
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pose.png"));
    }
}
