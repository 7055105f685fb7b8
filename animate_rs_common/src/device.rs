use candle_core::{Device, Result};

/// Number of accelerator ordinals usable on this host. Hosts without CUDA
/// report a single device (metal exposes one; CPU counts as one worker slot).
pub fn accelerator_count() -> usize {
    if candle_core::utils::cuda_is_available() {
        let mut count = 0;
        while count < 64 && Device::new_cuda(count).is_ok() {
            count += 1;
        }
        count.max(1)
    } else {
        1
    }
}

/// Pick the compute device for the given worker ordinal.
pub fn best_device(ordinal: usize) -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Device::new_cuda(ordinal)
    } else if candle_core::utils::metal_is_available() {
        Device::new_metal(ordinal)
    } else {
        Ok(Device::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_device() {
        assert!(accelerator_count() >= 1);
    }

    #[test]
    fn best_device_resolves() {
        best_device(0).unwrap();
    }
}
