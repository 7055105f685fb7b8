//! Checkpoint validation and loading helpers.
//!
//! Weight files are validated before any expensive model construction, and
//! key mismatches between a checkpoint and the module that consumes it are
//! reported but never fatal: checkpoints may legitimately omit auxiliary
//! buffers.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::warn;

/// Fail fast if any named weight file is missing, before models are built.
pub fn ensure_weights_exist<'a>(
    paths: impl IntoIterator<Item = (&'a str, &'a Path)>,
) -> Result<()> {
    for (component, path) in paths {
        if !path.is_file() {
            anyhow::bail!(
                "weights for `{component}` not found at {}",
                path.display()
            );
        }
    }
    Ok(())
}

/// List the tensor names stored in a safetensors file without loading any
/// tensor data.
pub fn safetensors_keys(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .with_context(|| format!("cannot open checkpoint {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)
        .with_context(|| format!("invalid safetensors file {}", path.display()))?;
    Ok(st.names().into_iter().map(|n| n.to_string()).collect())
}

/// The difference between the tensor names a module expects and the names a
/// checkpoint actually stores.
#[derive(Debug, Default)]
pub struct KeyReport {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl KeyReport {
    pub fn compare(expected: &[String], stored: &[String]) -> Self {
        let missing = expected
            .iter()
            .filter(|k| !stored.contains(k))
            .cloned()
            .collect();
        let unexpected = stored
            .iter()
            .filter(|k| !expected.contains(k))
            .cloned()
            .collect();
        Self { missing, unexpected }
    }

    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    /// Log the mismatch counts. A partial load is not an error.
    pub fn log(&self, component: &str) {
        if !self.is_clean() {
            warn!(
                "{component}: {} missing keys, {} unexpected keys",
                self.missing.len(),
                self.unexpected.len()
            );
            warn!(
                "{component}: missing: {:?}; unexpected: {:?}",
                self.missing, self.unexpected
            );
        }
    }
}

/// Mmap a safetensors checkpoint into a `VarBuilder` on the target device.
pub fn load_varbuilder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
    Ok(vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use std::collections::HashMap;

    #[test]
    fn missing_weights_name_the_path() {
        let err = ensure_weights_exist([("pose_guider", Path::new("/nonexistent/pg.safetensors"))])
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pg.safetensors"));
        assert!(err.to_string().contains("pose_guider"));
    }

    #[test]
    fn key_report_detects_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "conv_in.weight".to_string(),
            Tensor::zeros((4, 3, 3, 3), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "extra.buffer".to_string(),
            Tensor::zeros(4, DType::F32, &dev).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let stored = safetensors_keys(&path).unwrap();
        let expected = vec!["conv_in.weight".to_string(), "conv_in.bias".to_string()];
        let report = KeyReport::compare(&expected, &stored);
        assert_eq!(report.missing, vec!["conv_in.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["extra.buffer".to_string()]);
        assert!(!report.is_clean());
    }

    #[test]
    fn clean_report() {
        let keys = vec!["a".to_string(), "b".to_string()];
        assert!(KeyReport::compare(&keys, &keys).is_clean());
    }
}
