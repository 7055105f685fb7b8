//! Pose conditioning network.
//!
//! A small convolutional encoder that maps a pose raster to a 4-channel
//! residual at latent resolution (1/8th of the input), added to the noisy
//! latents before each UNet call.

use std::path::Path;

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};

use animate_rs_common::{load_varbuilder, safetensors_keys, KeyReport};

/// `(in_channels, out_channels, stride)` per block; three stride-2 blocks
/// take the spatial size down by 8x to match the latent grid.
const BLOCKS: [(usize, usize, usize); 6] = [
    (16, 16, 2),
    (16, 32, 1),
    (32, 32, 2),
    (32, 64, 1),
    (64, 64, 2),
    (64, 128, 1),
];

const LATENT_CHANNELS: usize = 4;

#[derive(Debug)]
pub struct PoseGuider {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl PoseGuider {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(3, 16, 3, cfg, vb.pp("conv_in"))?;
        let mut blocks = Vec::with_capacity(BLOCKS.len());
        for (i, (c_in, c_out, stride)) in BLOCKS.into_iter().enumerate() {
            let cfg = Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            };
            blocks.push(conv2d(c_in, c_out, 3, cfg, vb.pp(format!("blocks.{i}")))?);
        }
        let conv_out = conv2d(128, LATENT_CHANNELS, 3, cfg, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }

    /// Load from a safetensors checkpoint, auditing the stored keys first.
    /// A partial checkpoint is reported, not fatal.
    pub fn load(
        path: &Path,
        dtype: candle_core::DType,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let stored = safetensors_keys(path)?;
        KeyReport::compare(&Self::expected_keys(), &stored).log("pose_guider");
        let vb = load_varbuilder(path, dtype, device)?;
        Ok(Self::new(vb)?)
    }

    pub fn expected_keys() -> Vec<String> {
        let mut keys = vec!["conv_in.weight".to_string(), "conv_in.bias".to_string()];
        for i in 0..BLOCKS.len() {
            keys.push(format!("blocks.{i}.weight"));
            keys.push(format!("blocks.{i}.bias"));
        }
        keys.push("conv_out.weight".to_string());
        keys.push("conv_out.bias".to_string());
        keys
    }

    /// `(B, 3, H, W)` pose raster in `[0, 1]` to `(B, 4, H/8, W/8)` latent
    /// residual.
    pub fn forward(&self, pose: &Tensor) -> candle_core::Result<Tensor> {
        let mut hidden = self.conv_in.forward(pose)?.silu()?;
        for block in &self.blocks {
            hidden = block.forward(&hidden)?.silu()?;
        }
        self.conv_out.forward(&hidden)
    }
}
