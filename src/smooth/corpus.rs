// src/smooth/corpus.rs
// ============================================================================
// CALIBRATION CORPUS - Secuencias de tokens para calibrar
// ============================================================================
//
// Sin corpus externo se usan secuencias aleatorias uniformes sobre el
// vocabulario (pueden sobreestimar los rangos de activación).
//
// ============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Techo del vocabulario muestreado
pub const MAX_CALIBRATION_VOCAB: usize = 32000;

/// Muestras que realmente se procesan de las pedidas: una cuarta parte.
/// Prioriza velocidad sobre cobertura.
pub fn calibration_budget(n_samples: usize) -> usize {
    n_samples / 4
}

/// Conjunto ordenado de secuencias de calibración
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCorpus {
    samples: Vec<Vec<u32>>,
}

impl CalibrationCorpus {
    /// Corpus aleatorio, función pura de (seed, n, seq_len, vocab).
    /// Los tokens caen en [1, min(vocab, 32000)); el 0 se reserva.
    pub fn random(seed: u64, n_samples: usize, seq_len: usize, vocab_size: usize) -> Self {
        let upper = vocab_size.min(MAX_CALIBRATION_VOCAB) as u32;
        let mut rng = StdRng::seed_from_u64(seed);

        let samples = (0..n_samples)
            .map(|_| {
                (0..seq_len)
                    .map(|_| if upper > 1 { rng.gen_range(1..upper) } else { 0 })
                    .collect()
            })
            .collect();

        Self { samples }
    }

    pub fn from_samples(samples: Vec<Vec<u32>>) -> Self {
        Self { samples }
    }

    /// Corpus externo: JSON con un array de arrays de token ids
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read calibration corpus {}", path.display()))?;
        let samples: Vec<Vec<u32>> = serde_json::from_str(&text)
            .with_context(|| format!("Corpus {} must be a JSON array of token-id arrays", path.display()))?;
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Vec<u32>] {
        &self.samples
    }
}
