//! Core orchestration for pose-driven human image animation.
//!
//! A run is described by a YAML [`config::AnimationConfig`], executed by a
//! [`driver::SampleDriver`] over a [`pipelines::FrameGenerator`], and
//! optionally spread across processes with [`dist::DistContext`]. The
//! production generator is [`pipelines::AnimationPipeline`], a Stable
//! Diffusion v1.5 stack extended with a pose guider, a reference UNet, and a
//! CLIP image encoder.

pub mod config;
pub mod dist;
pub mod driver;
pub mod models;
pub mod pipelines;

pub use config::{AnimationConfig, ConfigError, SeedRecord};
pub use driver::SampleDriver;
pub use pipelines::{AnimationPipeline, FrameGenerator};

pub use animate_rs_common::{accelerator_count, best_device};
pub use candle_core::DType;
