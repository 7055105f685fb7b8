//! Image decode/resize and raster <-> tensor conversions.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, RgbImage};

/// Decode an image file into an RGB raster. Fatal with the offending path on
/// any decode failure.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("cannot decode image {}", path.display()))?;
    Ok(img.to_rgb8())
}

/// Resize to an exact square target, unless the raster already matches.
pub fn resize_square(img: &RgbImage, size: u32) -> RgbImage {
    if img.width() == size && img.height() == size {
        img.clone()
    } else {
        image::imageops::resize(img, size, size, FilterType::Lanczos3)
    }
}

pub fn load_image_square(path: &Path, size: u32) -> Result<RgbImage> {
    Ok(resize_square(&load_image(path)?, size))
}

/// `(C, H, W)` f32 tensor in `[0, 1]` from an RGB raster.
pub fn image_to_chw(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let data = img.as_raw().clone();
    let t = Tensor::from_vec(data, (h, w, 3), device)?
        .to_dtype(DType::F32)?
        .permute((2, 0, 1))?;
    Ok((t / 255.)?)
}

/// `(1, C, 1, H, W)` video-layout tensor from a single RGB raster.
pub fn image_to_video_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    Ok(image_to_chw(img, device)?.unsqueeze(0)?.unsqueeze(2)?)
}

/// RGB raster from a `(C, H, W)` f32 tensor in `[0, 1]`.
pub fn chw_to_image(frame: &Tensor) -> Result<RgbImage> {
    let (c, h, w) = frame.dims3()?;
    if c != 3 {
        anyhow::bail!("expected 3 channels, got {c}");
    }
    let data = (frame.clamp(0f32, 1f32)? * 255.)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| anyhow::anyhow!("raster has invalid capacity"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        })
    }

    #[test]
    fn resize_is_identity_on_matching_size() {
        let img = checker(16);
        let resized = resize_square(&img, 16);
        assert_eq!(img.as_raw(), resized.as_raw());
    }

    #[test]
    fn resize_hits_target() {
        let img = checker(20);
        let resized = resize_square(&img, 16);
        assert_eq!((resized.width(), resized.height()), (16, 16));
    }

    #[test]
    fn chw_round_trip() {
        let img = checker(8);
        let t = image_to_chw(&img, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 8, 8]);
        let back = chw_to_image(&t).unwrap();
        assert_eq!(img.as_raw(), back.as_raw());
    }

    #[test]
    fn video_tensor_layout() {
        let img = checker(8);
        let t = image_to_video_tensor(&img, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 3, 1, 8, 8]);
    }
}
