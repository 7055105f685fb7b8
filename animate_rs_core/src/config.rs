//! Run configuration.
//!
//! The configuration document is YAML. It is read once, validated before any
//! model loading, and never mutated afterwards: the seeds realized during a
//! run are accumulated in a separate [`SeedRecord`] and merged into the
//! persisted snapshot explicitly.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SEED_SENTINEL: i64 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("`source_image` lists {sources} entries but `video_path` lists {videos}; they are processed pairwise")]
    PairMismatch { sources: usize, videos: usize },
    #[error("seed list has {seeds} entries for {pairs} (source, video) pairs")]
    SeedCount { seeds: usize, pairs: usize },
}

/// A single seed replicated across all pairs, or one seed per pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SeedSpec {
    Single(i64),
    PerPair(Vec<i64>),
}

impl Default for SeedSpec {
    fn default() -> Self {
        Self::Single(SEED_SENTINEL)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnimationConfig {
    /// Diffusers-layout directory holding `unet/`, `vae/`, `text_encoder/`
    /// safetensors and `tokenizer/tokenizer.json`.
    pub pretrained_model_path: PathBuf,
    pub pretrained_poseguider_path: PathBuf,
    pub pretrained_referencenet_path: PathBuf,
    pub clip_model_path: PathBuf,

    #[serde(default)]
    pub savename: Option<String>,

    /// Denoising step count for the scheduler.
    pub steps: usize,
    /// Only the last N of `steps` denoising steps are executed when set.
    #[serde(default)]
    pub num_actual_inference_steps: Option<usize>,
    pub guidance_scale: f64,
    /// Temporal stride: the driving sequence is padded to a multiple of this.
    #[serde(rename = "L")]
    pub stride: usize,
    /// Square frame size in pixels.
    pub size: usize,

    #[serde(default)]
    pub seed: SeedSpec,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub max_length: Option<usize>,

    pub video_path: Vec<PathBuf>,
    pub source_image: Vec<PathBuf>,

    #[serde(default)]
    pub save_individual_videos: bool,
}

impl AnimationConfig {
    /// Parse and validate a config document. Every configuration error is
    /// fatal here, before any expensive model loading starts.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_image.len() != self.video_path.len() {
            return Err(ConfigError::PairMismatch {
                sources: self.source_image.len(),
                videos: self.video_path.len(),
            });
        }
        if let SeedSpec::PerPair(seeds) = &self.seed {
            if seeds.len() != self.pair_count() {
                return Err(ConfigError::SeedCount {
                    seeds: seeds.len(),
                    pairs: self.pair_count(),
                });
            }
        }
        Ok(())
    }

    pub fn pair_count(&self) -> usize {
        self.source_image.len()
    }

    /// One configured seed per pair; a scalar seed is replicated.
    pub fn resolved_seeds(&self) -> Vec<i64> {
        match &self.seed {
            SeedSpec::Single(s) => vec![*s; self.pair_count()],
            SeedSpec::PerPair(seeds) => seeds.clone(),
        }
    }

    /// Output directory for the run: `samples/<savename>`, or a timestamped
    /// name derived from the config file when no savename is set.
    pub fn save_dir(&self, config_path: &Path) -> PathBuf {
        match &self.savename {
            Some(name) => PathBuf::from("samples").join(name),
            None => {
                let stem = config_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "run".to_string());
                let time_str = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
                PathBuf::from("samples").join(format!("{stem}-{time_str}"))
            }
        }
    }

    /// Serialize the resolved configuration plus the realized seeds.
    pub fn snapshot(&self, seeds: &SeedRecord) -> anyhow::Result<String> {
        let snapshot = ConfigSnapshot {
            config: self.clone(),
            random_seed: seeds.realized.clone(),
        };
        Ok(serde_yaml::to_string(&snapshot)?)
    }
}

/// The seeds actually used during a run, in pair order. Kept separate from
/// the immutable configuration and merged only into the final snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedRecord {
    pub realized: Vec<u64>,
}

impl SeedRecord {
    pub fn push(&mut self, seed: u64) {
        self.realized.push(seed);
    }
}

#[derive(Serialize)]
struct ConfigSnapshot {
    #[serde(flatten)]
    config: AnimationConfig,
    random_seed: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASE: &str = r#"
pretrained_model_path: /weights/sd
pretrained_poseguider_path: /weights/poseguider.safetensors
pretrained_referencenet_path: /weights/referencenet.safetensors
clip_model_path: /weights/clip.safetensors
steps: 25
guidance_scale: 7.5
L: 16
size: 256
video_path: [a.mp4, b.mp4]
source_image: [a.png, b.png]
"#;

    fn write_config(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_run.yaml");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn scalar_seed_is_replicated() {
        let (_dir, path) = write_config(&format!("{BASE}seed: 42\n"));
        let config = AnimationConfig::load(&path).unwrap();
        assert_eq!(config.resolved_seeds(), vec![42, 42]);
    }

    #[test]
    fn per_pair_seeds_pass_through() {
        let (_dir, path) = write_config(&format!("{BASE}seed: [1, 2]\n"));
        let config = AnimationConfig::load(&path).unwrap();
        assert_eq!(config.resolved_seeds(), vec![1, 2]);
    }

    #[test]
    fn default_seed_is_the_sentinel() {
        let (_dir, path) = write_config(BASE);
        let config = AnimationConfig::load(&path).unwrap();
        assert_eq!(config.resolved_seeds(), vec![SEED_SENTINEL; 2]);
    }

    #[test]
    fn seed_count_mismatch_is_fatal() {
        let (_dir, path) = write_config(&format!("{BASE}seed: [1, 2, 3]\n"));
        let err = AnimationConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::SeedCount { seeds: 3, pairs: 2 }));
    }

    #[test]
    fn pair_mismatch_is_fatal() {
        let text = BASE.replace("source_image: [a.png, b.png]", "source_image: [a.png]");
        let (_dir, path) = write_config(&text);
        let err = AnimationConfig::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::PairMismatch { sources: 1, videos: 2 }
        ));
    }

    #[test]
    fn missing_field_is_fatal_with_path() {
        let text = BASE.replace("steps: 25\n", "");
        let (_dir, path) = write_config(&text);
        let err = AnimationConfig::load(&path).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("test_run.yaml"), "{msg}");
    }

    #[test]
    fn savename_wins_over_timestamp() {
        let (_dir, path) = write_config(&format!("{BASE}savename: demo\n"));
        let config = AnimationConfig::load(&path).unwrap();
        assert_eq!(config.save_dir(&path), PathBuf::from("samples/demo"));
    }

    #[test]
    fn fallback_save_dir_uses_config_stem() {
        let (_dir, path) = write_config(BASE);
        let config = AnimationConfig::load(&path).unwrap();
        let dir = config.save_dir(&path);
        assert!(dir.to_string_lossy().contains("samples/test_run-"));
    }

    #[test]
    fn snapshot_records_realized_seeds() {
        let (_dir, path) = write_config(&format!("{BASE}seed: 42\n"));
        let config = AnimationConfig::load(&path).unwrap();
        let mut record = SeedRecord::default();
        record.push(42);
        record.push(42);
        let snapshot = config.snapshot(&record).unwrap();
        assert!(snapshot.contains("random_seed:"), "{snapshot}");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&snapshot).unwrap();
        assert_eq!(
            parsed["random_seed"],
            serde_yaml::from_str::<serde_yaml::Value>("[42, 42]").unwrap()
        );
    }
}
