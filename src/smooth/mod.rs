// src/smooth/mod.rs
// ============================================================================
// SMOOTHQUANT - Calibración, síntesis de escalas y reescalado de pesos
// ============================================================================
//
//   corpus → ActivationProfiler → ActivationRecord
//          → ScaleSynthesizer   → Vec<LayerScale>
//          → WeightRescaler     → ScaleSet (persistible)
//
// ============================================================================

pub mod corpus;
pub mod profiler;
pub mod rescale;
pub mod synth;

use thiserror::Error;

pub use corpus::{calibration_budget, CalibrationCorpus};
pub use profiler::{ActivationProfiler, ActivationRecord, ProfileStats};
pub use rescale::{rescale_in_place, WeightRescaler};
pub use synth::{quantile, LayerScale, ScaleSynthesizer};

use crate::config::SmoothConfig;
use crate::model::CalibrationModel;
use crate::scales::ScaleSet;

#[derive(Debug, Error)]
pub enum SmoothError {
    #[error("alpha must be in [0, 1], got {0}")]
    InvalidAlpha(f32),

    #[error("Layer '{layer}': expected {expected} channels, got {got}")]
    LengthMismatch { layer: String, expected: usize, got: usize },

    #[error("Layer '{0}' not found in model")]
    UnknownLayer(String),
}

/// Sintetiza las escalas y reescala los pesos del modelo
pub fn smooth_model<M: CalibrationModel + ?Sized>(
    model: &mut M,
    record: &ActivationRecord,
    config: &SmoothConfig,
) -> Result<ScaleSet, SmoothError> {
    let synth = ScaleSynthesizer::from_config(config)?;
    log::info!("Applying SmoothQuant with alpha={}", synth.alpha());

    let scales = synth.synthesize(record, &*model)?;
    WeightRescaler::apply(model, scales)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedForwardModel, WeightTensor};

    #[test]
    fn test_smooth_model_preserves_layer_output() {
        // Y = (X / s) · (W · s)ᵀ: la salida lineal no cambia si la entrada se divide por s
        let embedding = WeightTensor::from_f32("emb", 3, 2, vec![0.0, 0.0, 2.0, -1.0, 0.5, 3.0]).unwrap();
        let l0 = WeightTensor::from_f32("l0", 2, 2, vec![1.0, 2.0, -0.5, 0.25]).unwrap();
        let mut model = FeedForwardModel::new(embedding, vec![("l0".to_string(), l0)], None).unwrap();
        let original = model.weight("l0").unwrap().to_f32();

        let corpus = CalibrationCorpus::from_samples(vec![vec![1, 2]; 8]);
        let (record, _) = ActivationProfiler::new().with_progress(false).profile(&mut model, &corpus);
        let scales = smooth_model(&mut model, &record, &SmoothConfig::default()).unwrap();

        assert_eq!(scales.layer_names(), vec!["l0"]);
        let s = scales.get("l0").unwrap().values().to_vec();
        assert_eq!(s.len(), 2);
        assert!(s.iter().all(|&x| x > 0.0));

        let rescaled = model.weight("l0").unwrap().to_f32();
        for (i, (r, o)) in rescaled.iter().zip(&original).enumerate() {
            assert!((r * s[i % 2] - o).abs() < 1e-6);
        }
    }
}
