//! The assembled animation pipeline: every pretrained sub-model plus the
//! DDIM scheduler behind one generate operation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL as AutoencoderKL,
    StableDiffusionConfig,
};
use tokenizers::Tokenizer;
use tracing::info;

use animate_rs_common::{
    ensure_weights_exist, raster, safetensors_keys, KeyReport, NiceProgressBar,
};

use crate::config::AnimationConfig;
use crate::models::{PoseGuider, ReferenceEncoder};
use crate::pipelines::{FrameGenerator, GenerationRequest};

const VAE_SCALE: f64 = 0.18215;
const LATENT_DOWNSAMPLE: usize = 8;

pub struct AnimationPipeline {
    pub unet: UNet2DConditionModel,
    /// Loaded and device-placed like every other component; attention fusion
    /// between the reference net and the denoising UNet is disabled at this
    /// stage.
    pub reference_net: UNet2DConditionModel,
    pub vae: AutoencoderKL,
    pub text_encoder: ClipTextTransformer,
    pub tokenizer: Tokenizer,
    pub pose_guider: PoseGuider,
    pub reference_encoder: ReferenceEncoder,
    sd_config: StableDiffusionConfig,
    device: Device,
    dtype: DType,
}

struct WeightPaths {
    unet: PathBuf,
    vae: PathBuf,
    clip_text: PathBuf,
    tokenizer: PathBuf,
}

impl WeightPaths {
    fn from_config(config: &AnimationConfig) -> Self {
        let base = &config.pretrained_model_path;
        Self {
            unet: base.join("unet/diffusion_pytorch_model.safetensors"),
            vae: base.join("vae/diffusion_pytorch_model.safetensors"),
            clip_text: base.join("text_encoder/model.safetensors"),
            tokenizer: base.join("tokenizer/tokenizer.json"),
        }
    }
}

impl AnimationPipeline {
    /// Load every sub-model onto the target device. Missing weight files are
    /// fatal with the exact path; checkpoint key mismatches are reported and
    /// tolerated.
    pub fn load(config: &AnimationConfig, device: &Device, dtype: DType) -> Result<Self> {
        let paths = WeightPaths::from_config(config);
        ensure_weights_exist([
            ("unet", paths.unet.as_path()),
            ("vae", paths.vae.as_path()),
            ("text_encoder", paths.clip_text.as_path()),
            ("tokenizer", paths.tokenizer.as_path()),
            ("pose_guider", config.pretrained_poseguider_path.as_path()),
            ("referencenet", config.pretrained_referencenet_path.as_path()),
            ("clip_image_encoder", config.clip_model_path.as_path()),
        ])?;

        let sd_config =
            StableDiffusionConfig::v1_5(None, Some(config.size), Some(config.size));

        info!("loading CLIP text encoder");
        let text_encoder = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            &paths.clip_text,
            device,
            DType::F32,
        )?;
        let tokenizer = Tokenizer::from_file(&paths.tokenizer).map_err(anyhow::Error::msg)?;

        info!("loading VAE");
        let vae = sd_config.build_vae(&paths.vae, device, dtype)?;

        info!("loading UNet");
        let unet = sd_config.build_unet(&paths.unet, device, 4, false, dtype)?;

        info!(
            "loading referencenet from {}",
            config.pretrained_referencenet_path.display()
        );
        // The reference net shares the UNet architecture; audit its stored
        // keys against the denoising UNet's checkpoint.
        let unet_keys = safetensors_keys(&paths.unet)?;
        let reference_keys = safetensors_keys(&config.pretrained_referencenet_path)?;
        KeyReport::compare(&unet_keys, &reference_keys).log("referencenet");
        let reference_net = sd_config.build_unet(
            &config.pretrained_referencenet_path,
            device,
            4,
            false,
            dtype,
        )?;

        info!(
            "loading pose guider from {}",
            config.pretrained_poseguider_path.display()
        );
        let pose_guider = PoseGuider::load(&config.pretrained_poseguider_path, dtype, device)?;

        info!("loading CLIP image encoder");
        let reference_encoder = ReferenceEncoder::load(&config.clip_model_path, device)?;

        Ok(Self {
            unet,
            reference_net,
            vae,
            text_encoder,
            tokenizer,
            pose_guider,
            reference_encoder,
            sd_config,
            device: device.clone(),
            dtype,
        })
    }

    /// `(1, 77, hidden)` CLIP text embedding of a prompt, padded to the
    /// encoder's position count.
    fn encode_text(&self, prompt: &str) -> Result<Tensor> {
        let pad_token = match &self.sd_config.clip.pad_with {
            Some(padding) => padding.clone(),
            None => "<|endoftext|>".to_string(),
        };
        let pad_id = *self
            .tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .with_context(|| format!("pad token `{pad_token}` missing from tokenizer vocab"))?;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = self.sd_config.clip.max_position_embeddings;
        tokens.truncate(max_len);
        while tokens.len() < max_len {
            tokens.push(pad_id);
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&tokens)?)
    }

    /// Conditioning tokens: prompt embedding with the reference image
    /// embedding appended as one extra token; doubled along batch for
    /// classifier-free guidance.
    fn conditioning(&self, request: &GenerationRequest, use_guidance: bool) -> Result<Tensor> {
        let text = self.encode_text(&request.prompt)?;
        let image_embed = self
            .reference_encoder
            .encode(&request.source_image)?
            .unsqueeze(1)?;
        let cond = Tensor::cat(&[&text, &image_embed], 1)?;
        let states = if use_guidance {
            let uncond_text = self.encode_text(&request.negative_prompt)?;
            let uncond = Tensor::cat(&[&uncond_text, &image_embed.zeros_like()?], 1)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(states.to_dtype(self.dtype)?)
    }
}

impl FrameGenerator for AnimationPipeline {
    fn set_seed(&mut self, seed: u64) -> Result<()> {
        self.device.set_seed(seed)?;
        Ok(())
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<Tensor> {
        let params = request.params;
        let use_guidance = params.guidance_scale > 1.0;
        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;

        let (height, width) = (
            request.source_image.height() as usize,
            request.source_image.width() as usize,
        );
        let (latent_h, latent_w) = (height / LATENT_DOWNSAMPLE, width / LATENT_DOWNSAMPLE);

        let encoder_hidden_states = self.conditioning(request, use_guidance)?;

        let pose = raster::image_to_chw(&request.pose_condition, &self.device)?
            .unsqueeze(0)?
            .to_dtype(self.dtype)?;
        let pose_features = self.pose_guider.forward(&pose)?;
        let pose_features = if use_guidance {
            Tensor::cat(&[&pose_features, &pose_features], 0)?
        } else {
            pose_features
        };

        let latents = Tensor::randn(0f32, 1f32, (1, 4, latent_h, latent_w), &self.device)?;
        // scale the initial noise by the standard deviation required by the scheduler
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        let actual = params
            .num_actual_inference_steps
            .unwrap_or(params.steps)
            .min(params.steps);
        let t_start = timesteps.len().saturating_sub(actual);
        for (_i, &timestep) in
            NiceProgressBar::<_, 'g'>(timesteps.iter().enumerate().skip(t_start), "Denoise")
        {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input =
                scheduler.scale_model_input(latent_model_input, timestep)?;
            let latent_model_input = (latent_model_input + &pose_features)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &encoder_hidden_states)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.clamp(0f32, 1f32)?;
        Ok(image.to_dtype(DType::F32)?.permute((0, 2, 3, 1))?)
    }
}
