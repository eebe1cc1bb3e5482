// src/config.rs
// ============================================================================
// CONFIG - Parámetros de calibración y de merge
// ============================================================================
//
// Se cargan desde JSON (opcional) y el CLI sobreescribe campo a campo.
//
// ============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ALPHA: f32 = 0.5;
pub const DEFAULT_SAMPLES: usize = 64;
pub const DEFAULT_SEQ_LEN: usize = 128;
pub const DEFAULT_PERCENTILE: f32 = 0.95;
pub const DEFAULT_EPSILON: f32 = 1e-5;

/// Cada cuántas muestras se pide al modelo liberar caché
pub const HOUSEKEEPING_INTERVAL: usize = 10;

/// Parámetros de SmoothQuant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothConfig {
    /// Exponente α en [0, 1]
    pub alpha: f32,
    /// Muestras pedidas (solo se procesa una cuarta parte)
    pub n_samples: usize,
    pub seq_len: usize,
    pub seed: u64,
    /// Percentil sobre el eje de batches (0.95 = p95)
    pub percentile: f32,
    pub epsilon: f32,
}

impl Default for SmoothConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            n_samples: DEFAULT_SAMPLES,
            seq_len: DEFAULT_SEQ_LEN,
            seed: 0,
            percentile: DEFAULT_PERCENTILE,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl SmoothConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.alpha.is_finite() || !(0.0..=1.0).contains(&self.alpha) {
            return Err(format!("alpha must be in [0, 1], got {}", self.alpha));
        }
        if !(0.0..=1.0).contains(&self.percentile) {
            return Err(format!("percentile must be in [0, 1], got {}", self.percentile));
        }
        if !(self.epsilon > 0.0) {
            return Err(format!("epsilon must be positive, got {}", self.epsilon));
        }
        if self.seq_len == 0 {
            return Err("seq_len must be > 0".to_string());
        }
        Ok(())
    }
}

/// Parámetros del paso de conversión + merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Namespaces adicionales a copiar (además de general. y tokenizer.)
    pub extra_namespaces: Vec<String>,
    pub version: String,
    /// Ejecutable del conversor externo
    pub converter_program: String,
    /// Argumentos que preceden a los posicionales (ej: el script)
    pub converter_args: Vec<String>,
    pub outtype: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            extra_namespaces: Vec::new(),
            version: "1.0".to_string(),
            converter_program: "python3".to_string(),
            converter_args: vec!["convert_hf_to_gguf.py".to_string()],
            outtype: "f16".to_string(),
        }
    }
}

/// Fichero de configuración completo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub smooth: SmoothConfig,
    pub merge: MergeConfig,
}

impl Config {
    /// Lee la configuración desde un JSON; campos ausentes toman su default
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config JSON in {}", path.display()))?;
        config.smooth.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = SmoothConfig::default();
        assert_eq!(c.alpha, 0.5);
        assert_eq!(c.percentile, 0.95);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let c: Config = serde_json::from_str(r#"{"smooth": {"alpha": 0.8}}"#).unwrap();
        assert_eq!(c.smooth.alpha, 0.8);
        assert_eq!(c.smooth.seq_len, DEFAULT_SEQ_LEN);
        assert_eq!(c.merge.version, "1.0");
    }

    #[test]
    fn test_rejects_bad_alpha() {
        let c = SmoothConfig { alpha: 1.5, ..Default::default() };
        assert!(c.validate().is_err());
        let c = SmoothConfig { alpha: f32::NAN, ..Default::default() };
        assert!(c.validate().is_err());
    }
}
