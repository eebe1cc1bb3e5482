// src/smooth/rescale.rs
// ============================================================================
// WEIGHT RESCALER - W[o, c] /= s[c]  in-place
// ============================================================================
//
// F16/BF16: cada elemento sube a f32, se divide y vuelve a su dtype dentro
// del mismo buffer. Dividir directamente en media precisión por escalas
// << 1 pierde bits.
//
// ============================================================================

use half::{bf16, f16};
use rayon::prelude::*;

use super::synth::LayerScale;
use super::SmoothError;
use crate::model::{CalibrationModel, WeightData, WeightTensor};
use crate::scales::{ScaleSet, ScaleValue};

/// Divide cada columna de `weight` por su escala. Sin reasignar el buffer.
pub fn rescale_in_place(layer: &str, weight: &mut WeightTensor, scale: &[f32]) -> Result<(), SmoothError> {
    let cols = weight.cols();
    if scale.len() != cols {
        return Err(SmoothError::LengthMismatch {
            layer: layer.to_string(),
            expected: cols,
            got: scale.len(),
        });
    }
    if cols == 0 {
        return Ok(());
    }

    match weight.data_mut() {
        WeightData::F32(v) => {
            v.par_chunks_mut(cols).for_each(|row| {
                for (w, s) in row.iter_mut().zip(scale) {
                    *w /= s;
                }
            });
        }
        WeightData::F16(v) => {
            v.par_chunks_mut(cols).for_each(|row| {
                for (w, s) in row.iter_mut().zip(scale) {
                    *w = f16::from_f32(w.to_f32() / s);
                }
            });
        }
        WeightData::BF16(v) => {
            v.par_chunks_mut(cols).for_each(|row| {
                for (w, s) in row.iter_mut().zip(scale) {
                    *w = bf16::from_f32(w.to_f32() / s);
                }
            });
        }
    }

    Ok(())
}

pub struct WeightRescaler;

impl WeightRescaler {
    /// Aplica cada escala a su capa y devuelve la copia registrada para persistir
    pub fn apply<M: CalibrationModel + ?Sized>(
        model: &mut M,
        scales: Vec<LayerScale>,
    ) -> Result<ScaleSet, SmoothError> {
        let mut applied = ScaleSet::new();

        for LayerScale { layer, values } in scales {
            let weight = model
                .weight_mut(&layer)
                .ok_or_else(|| SmoothError::UnknownLayer(layer.clone()))?;
            rescale_in_place(&layer, weight, &values)?;

            let value = ScaleValue::Vector(values);
            let (lo, hi) = value.range();
            log::info!("Applied SmoothQuant to {}, scale range: [{:.4}, {:.4}]", layer, lo, hi);
            applied.insert(layer, value);
        }

        Ok(applied)
    }
}
