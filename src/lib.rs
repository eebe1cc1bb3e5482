// src/lib.rs
// ============================================================================
// SMOOTHQUANT-GGUF - Calibración SmoothQuant y metadata de escalas en GGUF
// ============================================================================

pub mod config;
pub mod convert;
pub mod error;
pub mod gguf;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod safetensor;
pub mod scales;
pub mod smooth;

// Re-exports principales
pub use config::{Config, MergeConfig, SmoothConfig};
pub use error::{exit_code_for, PipelineError};
pub use gguf::{GgufFile, GgufWriter};
pub use merge::{ContainerMetadataMerger, ContainerVerifier, FieldFilter, MergeReport};
pub use model::{CalibrationModel, FeedForwardModel, HookRegistry, WeightTensor};
pub use safetensor::{SafetensorReader, SafetensorWriter};
pub use scales::{ScaleSet, ScaleStore, ScaleValue};
pub use smooth::{smooth_model, ActivationProfiler, CalibrationCorpus, ScaleSynthesizer, WeightRescaler};
