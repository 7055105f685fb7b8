//! Reference image encoder.
//!
//! Embeds the source image with a CLIP ViT-B/32 vision transformer; the
//! pooled embedding is appended to the UNet's conditioning tokens. Pixel
//! preprocessing (square resize to the CLIP input size, CLIP mean/std
//! normalization) lives here as well.

use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use image::RgbImage;

use animate_rs_common::{load_varbuilder, raster};

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub struct ReferenceEncoder {
    model: ClipVisionTransformer,
    config: ClipVisionConfig,
    device: Device,
}

impl ReferenceEncoder {
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let config = ClipVisionConfig::vit_base_patch32();
        let vb = load_varbuilder(path, DType::F32, device)?;
        let model = ClipVisionTransformer::new(vb.pp("vision_model"), &config)?;
        Ok(Self {
            model,
            config,
            device: device.clone(),
        })
    }

    pub fn embed_dim(&self) -> usize {
        self.config.embed_dim
    }

    /// Pooled `(1, embed_dim)` embedding of an RGB raster.
    pub fn encode(&self, image: &RgbImage) -> Result<Tensor> {
        let pixels = self.preprocess(image)?;
        Ok(self.model.forward(&pixels)?)
    }

    fn preprocess(&self, image: &RgbImage) -> Result<Tensor> {
        let resized = raster::resize_square(image, self.config.image_size as u32);
        let chw = raster::image_to_chw(&resized, &self.device)?;
        let mean = Tensor::new(&CLIP_MEAN, &self.device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&CLIP_STD, &self.device)?.reshape((3, 1, 1))?;
        let normalized = chw.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(normalized.unsqueeze(0)?)
    }
}
