//! Shared plumbing for animate_rs: device selection, progress reporting,
//! checkpoint inspection, and the raster/video I/O adapters used by the
//! sample driver.

mod checkpoint;
mod device;
mod progress;
pub mod raster;
pub mod video;

pub use checkpoint::{ensure_weights_exist, load_varbuilder, safetensors_keys, KeyReport};
pub use device::{accelerator_count, best_device};
pub use progress::{IterWithProgress, NiceProgressBar};
