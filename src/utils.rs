use std::path::Path;

use tch::Device;

use crate::config::ExecutionTarget;
use crate::error::{Error, Result};

// A simple wrapper around File::open adding details about the
// problematic file.
pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|source| Error::Io {
        path: path.as_ref().to_string_lossy().into_owned(),
        source,
    })
}

/// Picks the torch device for an execution target. An accelerated target
/// uses Metal when available, then CUDA, and otherwise falls back to the CPU.
pub fn device_for(target: ExecutionTarget) -> Device {
    match target {
        ExecutionTarget::Cpu => Device::Cpu,
        ExecutionTarget::Accelerated => {
            if tch::utils::has_mps() {
                Device::Mps
            } else {
                let device = Device::cuda_if_available();
                if device == Device::Cpu {
                    tracing::warn!("no accelerated backend available, falling back to cpu");
                }
                device
            }
        }
    }
}
