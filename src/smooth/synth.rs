// src/smooth/synth.rs
// ============================================================================
// SCALE SYNTHESIZER - s = act^α / w^(1-α) por canal de entrada
// ============================================================================
//
// act: percentil 95 sobre batches (no el máximo: robusto ante outliers)
// w:   max |W| por columna (reducido sobre out_features)
// Ambos se recortan a epsilon antes de combinar. Todo en f32.
//
// ============================================================================

use super::SmoothError;
use crate::config::{SmoothConfig, DEFAULT_EPSILON, DEFAULT_PERCENTILE};
use crate::model::{CalibrationModel, WeightTensor};
use crate::smooth::profiler::ActivationRecord;

/// Vector de suavizado de una capa
#[derive(Debug, Clone, PartialEq)]
pub struct LayerScale {
    pub layer: String,
    pub values: Vec<f32>,
}

/// Cuantil con interpolación lineal entre estadísticos de orden.
/// `values` se reordena.
pub fn quantile(values: &mut [f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let pos = q.clamp(0.0, 1.0) * (values.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f32;
    values[lo] + (values[hi] - values[lo]) * frac
}

#[derive(Debug, Clone)]
pub struct ScaleSynthesizer {
    alpha: f32,
    percentile: f32,
    epsilon: f32,
}

impl ScaleSynthesizer {
    pub fn new(alpha: f32) -> Result<Self, SmoothError> {
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return Err(SmoothError::InvalidAlpha(alpha));
        }
        Ok(Self {
            alpha,
            percentile: DEFAULT_PERCENTILE,
            epsilon: DEFAULT_EPSILON,
        })
    }

    pub fn from_config(config: &SmoothConfig) -> Result<Self, SmoothError> {
        let mut synth = Self::new(config.alpha)?;
        synth.percentile = config.percentile;
        synth.epsilon = config.epsilon;
        Ok(synth)
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Percentil por canal sobre el eje de batches
    pub fn activation_stat(&self, layer: &str, batches: &[Vec<f32>]) -> Result<Vec<f32>, SmoothError> {
        let channels = batches.first().map_or(0, |b| b.len());
        if let Some(bad) = batches.iter().find(|b| b.len() != channels) {
            return Err(SmoothError::LengthMismatch {
                layer: layer.to_string(),
                expected: channels,
                got: bad.len(),
            });
        }

        let mut column = vec![0.0f32; batches.len()];
        let stat = (0..channels)
            .map(|c| {
                for (slot, batch) in column.iter_mut().zip(batches) {
                    *slot = batch[c];
                }
                quantile(&mut column, self.percentile)
            })
            .collect();
        Ok(stat)
    }

    /// max |W| por columna de entrada
    pub fn weight_stat(weight: &WeightTensor) -> Vec<f32> {
        let cols = weight.cols();
        let mut stat = vec![0.0f32; cols];
        if cols == 0 {
            return stat;
        }
        for row in weight.to_f32().chunks_exact(cols) {
            for (m, &w) in stat.iter_mut().zip(row) {
                *m = m.max(w.abs());
            }
        }
        stat
    }

    /// Combina ambas estadísticas en el vector de suavizado
    pub fn combine(&self, act: &[f32], weight: &[f32]) -> Vec<f32> {
        act.iter()
            .zip(weight)
            .map(|(&a, &w)| {
                let a = a.max(self.epsilon);
                let w = w.max(self.epsilon);
                a.powf(self.alpha) / w.powf(1.0 - self.alpha)
            })
            .collect()
    }

    /// Una escala por capa presente en el registro y en el modelo
    pub fn synthesize<M: CalibrationModel + ?Sized>(
        &self,
        record: &ActivationRecord,
        model: &M,
    ) -> Result<Vec<LayerScale>, SmoothError> {
        let mut scales = Vec::with_capacity(record.len());

        for (layer, batches) in record.iter() {
            if batches.is_empty() {
                continue;
            }
            let Some(weight) = model.weight(layer) else {
                log::debug!("Layer '{}' has statistics but no weight; skipped", layer);
                continue;
            };

            let act = self.activation_stat(layer, batches)?;
            if act.len() != weight.cols() {
                return Err(SmoothError::LengthMismatch {
                    layer: layer.to_string(),
                    expected: weight.cols(),
                    got: act.len(),
                });
            }

            let w = Self::weight_stat(weight);
            let values = self.combine(&act, &w);
            scales.push(LayerScale { layer: layer.to_string(), values });
        }

        Ok(scales)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeedForwardModel;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_quantile_linear() {
        let mut v: Vec<f32> = (1..=21).map(|x| x as f32).collect();
        assert!((quantile(&mut v, 0.95) - 20.0).abs() < 1e-4);
        let mut v = vec![4.0, 1.0, 3.0, 2.0];
        assert!((quantile(&mut v, 0.95) - 3.85).abs() < 1e-5);
        let mut one = vec![7.0];
        assert_eq!(quantile(&mut one, 0.95), 7.0);
    }

    #[test]
    fn test_percentile_ignores_single_outlier() {
        let synth = ScaleSynthesizer::new(0.5).unwrap();
        let mut batches: Vec<Vec<f32>> = (0..99).map(|_| vec![1.0]).collect();
        batches.push(vec![1000.0]);
        let stat = synth.activation_stat("x", &batches).unwrap();
        assert!(stat[0] < 2.0);
    }

    #[test]
    fn test_alpha_bounds() {
        let act = [4.0, 0.5, 2.0];
        let w = [2.0, 8.0, 0.25];

        let s0 = ScaleSynthesizer::new(0.0).unwrap().combine(&act, &w);
        assert_close(&s0, &[0.5, 0.125, 4.0], 1e-6);

        let s1 = ScaleSynthesizer::new(1.0).unwrap().combine(&act, &w);
        assert_close(&s1, &act, 1e-6);
    }

    #[test]
    fn test_epsilon_clamp_keeps_positive() {
        let synth = ScaleSynthesizer::new(0.5).unwrap();
        let s = synth.combine(&[0.0, 1.0], &[1.0, 0.0]);
        assert!(s.iter().all(|&x| x > 0.0 && x.is_finite()));
    }

    #[test]
    fn test_invalid_alpha() {
        assert!(ScaleSynthesizer::new(-0.1).is_err());
        assert!(ScaleSynthesizer::new(1.01).is_err());
    }

    #[test]
    fn test_two_layer_scenario() {
        // A: 4 canales, B: 2 canales
        let embedding = WeightTensor::from_f32("emb", 2, 4, vec![0.0; 8]).unwrap();
        let a = WeightTensor::from_f32("A", 2, 4, vec![
            2.0, -2.0, 1.0, 2.0,
            -1.0, 0.5, -2.0, -2.0,
        ]).unwrap();
        let b = WeightTensor::from_f32("B", 3, 2, vec![1.0, -1.0, 0.5, 0.5, -1.0, 1.0]).unwrap();
        let model = FeedForwardModel::new(
            embedding,
            vec![("A".to_string(), a), ("B".to_string(), b)],
            None,
        )
        .unwrap();

        let mut record = ActivationRecord::new();
        record.push("A", vec![1.0, 2.0, 3.0, 4.0]);
        record.push("B", vec![5.0, 6.0]);

        let scales = ScaleSynthesizer::new(0.5).unwrap().synthesize(&record, &model).unwrap();
        assert_eq!(scales.len(), 2);
        assert_eq!(scales[0].layer, "A");
        assert_close(&scales[0].values, &[0.707, 1.0, 1.225, 1.414], 1e-3);
        assert_eq!(scales[1].layer, "B");
        assert_close(&scales[1].values, &[2.236, 2.449], 1e-3);
    }

    #[test]
    fn test_weight_stat_zero_width() {
        let w = WeightTensor::from_f32("w", 3, 0, Vec::new()).unwrap();
        assert!(ScaleSynthesizer::weight_stat(&w).is_empty());
    }

    #[test]
    fn test_ragged_batches_rejected() {
        let synth = ScaleSynthesizer::new(0.5).unwrap();
        assert!(synth.activation_stat("x", &[vec![1.0, 2.0], vec![1.0]]).is_err());
    }
}
