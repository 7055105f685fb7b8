//! Video decode/encode adapters.
//!
//! Containers are read and written through an `ffmpeg` subprocess with PNG
//! frames as the interchange format. Encoding is near-lossless (x264 qp 0,
//! 4:4:4) so that a grid video can be re-decoded for its thumbnail without
//! visible drift. Any codec or container failure is fatal; this is a
//! single-shot batch tool, not a service.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use candle_core::Tensor;
use image::RgbImage;
use tracing::debug;

use crate::progress::IterWithProgress;
use crate::raster::chw_to_image;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Whether the `ffmpeg` binary can be invoked on this host.
pub fn ffmpeg_available() -> bool {
    Command::new("ffmpeg").arg("-version").output().is_ok()
}

fn scratch_dir(tag: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "animate_rs_{tag}_{}_{}",
        std::process::id(),
        SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create scratch dir {}", dir.display()))?;
    Ok(dir)
}

fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let output = Command::new("ffmpeg")
        .args(args)
        .output()
        .context("failed to run ffmpeg; make sure it is installed")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg failed: {stderr}");
    }
    Ok(())
}

/// Decode every frame of a video file, in order.
pub fn read_video_frames(path: &Path) -> Result<Vec<RgbImage>> {
    if !path.is_file() {
        anyhow::bail!("video not found at {}", path.display());
    }
    let scratch = scratch_dir("decode")?;
    let pattern = scratch.join("frame_%05d.png");
    let result = run_ffmpeg(&[
        "-i",
        &path.to_string_lossy(),
        "-y",
        &pattern.to_string_lossy(),
    ]);
    if let Err(e) = result {
        let _ = fs::remove_dir_all(&scratch);
        return Err(e.context(format!("cannot decode video {}", path.display())));
    }

    let mut frame_paths: Vec<_> = fs::read_dir(&scratch)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    frame_paths.sort();

    let mut frames = Vec::with_capacity(frame_paths.len());
    for p in &frame_paths {
        frames.push(image::open(p)?.to_rgb8());
    }
    let _ = fs::remove_dir_all(&scratch);

    if frames.is_empty() {
        anyhow::bail!("no frames decoded from {}", path.display());
    }
    debug!("decoded {} frames from {}", frames.len(), path.display());
    Ok(frames)
}

/// Encode rasters to a video container at the given frame rate.
pub fn write_video(frames: &[RgbImage], path: &Path, fps: u32) -> Result<()> {
    if frames.is_empty() {
        anyhow::bail!("cannot encode an empty frame sequence to {}", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create output dir {}", parent.display()))?;
    }
    let scratch = scratch_dir("encode")?;
    // Progress is only worth the terminal noise for longer sequences.
    for (i, frame) in frames.iter().enumerate().with_progress(frames.len() <= 16) {
        frame.save(scratch.join(format!("frame_{:05}.png", i + 1)))?;
    }
    let pattern = scratch.join("frame_%05d.png");
    let result = run_ffmpeg(&[
        "-y",
        "-framerate",
        &fps.to_string(),
        "-i",
        &pattern.to_string_lossy(),
        "-c:v",
        "libx264",
        "-qp",
        "0",
        "-pix_fmt",
        "yuv444p",
        &path.to_string_lossy(),
    ]);
    let _ = fs::remove_dir_all(&scratch);
    result.with_context(|| format!("cannot encode video {}", path.display()))?;
    debug!("wrote {} frames to {}", frames.len(), path.display());
    Ok(())
}

/// Encode a `(B, C, T, H, W)` f32 tensor in `[0, 1]` as a video: for each
/// time step, the batch entries are tiled vertically into one frame.
pub fn write_video_grid(videos: &Tensor, path: &Path, fps: u32) -> Result<()> {
    let (b, _c, t, _h, _w) = videos.dims5()?;
    let mut frames = Vec::with_capacity(t);
    for ti in 0..t {
        let mut rows = Vec::with_capacity(b);
        for bi in 0..b {
            let row = videos
                .narrow(0, bi, 1)?
                .narrow(2, ti, 1)?
                .squeeze(2)?
                .squeeze(0)?;
            rows.push(row);
        }
        let tiled = Tensor::cat(&rows, 1)?;
        frames.push(chw_to_image(&tiled)?);
    }
    write_video(&frames, path, fps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::image_to_video_tensor;
    use candle_core::Device;

    fn gradient(size: u32, shift: u8) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            image::Rgb([(x * 3) as u8, (y * 3) as u8, shift])
        })
    }

    fn max_abs_diff(a: &RgbImage, b: &RgbImage) -> u8 {
        a.as_raw()
            .iter()
            .zip(b.as_raw())
            .map(|(x, y)| x.abs_diff(*y))
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn encode_decode_round_trip() {
        if !ffmpeg_available() {
            eprintln!("skipping: ffmpeg not found");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let frames: Vec<_> = (0..3).map(|i| gradient(64, i * 40)).collect();
        write_video(&frames, &path, 8).unwrap();

        let decoded = read_video_frames(&path).unwrap();
        assert_eq!(decoded.len(), 3);
        // qp-0 4:4:4 still rounds through YUV, so allow a small tolerance.
        assert!(max_abs_diff(&frames[0], &decoded[0]) <= 4);
    }

    #[test]
    fn grid_tiles_batch_vertically() {
        if !ffmpeg_available() {
            eprintln!("skipping: ffmpeg not found");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.mp4");
        let dev = Device::Cpu;
        let a = image_to_video_tensor(&gradient(32, 0), &dev).unwrap();
        let b = image_to_video_tensor(&gradient(32, 200), &dev).unwrap();
        let grid = Tensor::cat(&[a, b], 0).unwrap();
        write_video_grid(&grid, &path, 1).unwrap();

        let decoded = read_video_frames(&path).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].width(), 32);
        assert_eq!(decoded[0].height(), 64);
    }

    #[test]
    fn empty_sequence_is_an_error() {
        let err = write_video(&[], Path::new("/tmp/never.mp4"), 1).unwrap_err();
        assert!(err.to_string().contains("empty frame sequence"));
    }

    #[test]
    fn missing_video_is_an_error() {
        let err = read_video_frames(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/clip.mp4"));
    }
}
