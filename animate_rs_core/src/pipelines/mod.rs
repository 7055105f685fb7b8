mod animation;

pub use animation::AnimationPipeline;

use anyhow::Result;
use candle_core::Tensor;
use image::RgbImage;

/// Sampling hyperparameters for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    /// Scheduler step count.
    pub steps: usize,
    /// Only the last N of `steps` denoising steps are executed when set.
    pub num_actual_inference_steps: Option<usize>,
    pub guidance_scale: f64,
}

/// Conditioning inputs for one generation call. Text conditioning is
/// effectively disabled in this driver: both prompts stay neutral and the
/// generation is driven by the source image and the pose condition frame.
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub source_image: RgbImage,
    pub pose_condition: RgbImage,
    pub params: GenerationParams,
}

/// The single generation capability the sample driver depends on: given
/// conditioning inputs, produce frames. The production implementation is
/// [`AnimationPipeline`]; tests drive the orchestration with a stub.
pub trait FrameGenerator {
    /// Reseed the model framework's random source.
    fn set_seed(&mut self, seed: u64) -> Result<()>;

    /// Produce a `(1, H, W, 3)` f32 frame tensor in `[0, 1]` at the source
    /// image's resolution.
    fn generate(&mut self, request: &GenerationRequest) -> Result<Tensor>;
}
