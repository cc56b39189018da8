//! Accelerator capability detection, queried once at startup.

use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Config override for capability detection. `Auto` probes the runtime;
/// the force modes pin the answer, which also makes the precision policy
/// deterministic in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorMode {
    #[default]
    Auto,
    ForceCpu,
    ForceGpu,
}

/// Performance, not correctness: reduced precision halves tensor traffic on
/// hardware that benefits from it. CPU inference stays in full precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    Reduced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub accelerator: bool,
}

impl Capability {
    pub fn precision(self) -> Precision {
        if self.accelerator {
            Precision::Reduced
        } else {
            Precision::Full
        }
    }
}

pub fn detect_accelerator() -> bool {
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

pub fn capability(mode: AcceleratorMode) -> Capability {
    let accelerator = match mode {
        AcceleratorMode::Auto => detect_accelerator(),
        AcceleratorMode::ForceCpu => false,
        AcceleratorMode::ForceGpu => true,
    };

    info!(?mode, accelerator, "Accelerator capability resolved");
    Capability { accelerator }
}
