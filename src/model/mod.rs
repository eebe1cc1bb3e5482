// src/model/mod.rs
// ============================================================================
// MODEL - Tensores de peso, activaciones y la interfaz de calibración
// ============================================================================
//
// El profiler y el rescaler solo conocen `CalibrationModel`.
// Cualquier modelo con capas lineales nombradas y un forward instrumentable
// puede calibrarse.
//
// ============================================================================

pub mod feedforward;
pub mod hooks;

use half::{bf16, f16};
use thiserror::Error;

pub use feedforward::FeedForwardModel;
pub use hooks::{HookId, HookRegistry, InstrumentationScope, Observer};

/// Fallos de un forward individual (recuperables durante la calibración)
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Layer '{layer}' expects {expected} input features, got {got}")]
    ShapeMismatch { layer: String, expected: usize, got: usize },

    #[error("Token id {token} out of range (vocab {vocab})")]
    TokenOutOfRange { token: u32, vocab: usize },

    #[error("Non-finite activation entering '{layer}'")]
    NonFinite { layer: String },

    #[error("Empty input sequence")]
    EmptyInput,

    #[error("Unknown layer '{0}'")]
    UnknownLayer(String),

    #[error("Tensor '{name}': {numel} elements do not fit shape {rows}x{cols}")]
    BadTensor { name: String, numel: usize, rows: usize, cols: usize },
}

/// Capa lineal elegible para SmoothQuant: todas menos la cabeza de salida
pub fn is_eligible_layer(name: &str) -> bool {
    !name.contains("lm_head")
}

/// Almacenamiento de un tensor de pesos en su precisión nativa
#[derive(Debug, Clone, PartialEq)]
pub enum WeightData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
}

impl WeightData {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::BF16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nombre del dtype en convención safetensors
    pub fn dtype(&self) -> &'static str {
        match self {
            Self::F32(_) => "F32",
            Self::F16(_) => "F16",
            Self::BF16(_) => "BF16",
        }
    }

    /// Decodifica bytes little-endian
    pub fn from_le_bytes(dtype: &str, bytes: &[u8]) -> Option<Self> {
        match dtype {
            "F32" => Some(Self::F32(
                bytes.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            )),
            "F16" => Some(Self::F16(
                bytes.chunks_exact(2).map(|b| f16::from_le_bytes([b[0], b[1]])).collect(),
            )),
            "BF16" => Some(Self::BF16(
                bytes.chunks_exact(2).map(|b| bf16::from_le_bytes([b[0], b[1]])).collect(),
            )),
            _ => None,
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Copia en f32
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Self::F32(v) => v.clone(),
            Self::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }
}

/// Matriz de pesos [out_features, in_features], row-major
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    rows: usize,
    cols: usize,
    data: WeightData,
}

impl WeightTensor {
    pub fn new(name: &str, rows: usize, cols: usize, data: WeightData) -> Result<Self, ModelError> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(ModelError::BadTensor {
                name: name.to_string(),
                numel: data.len(),
                rows,
                cols,
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_f32(name: &str, rows: usize, cols: usize, values: Vec<f32>) -> Result<Self, ModelError> {
        Self::new(name, rows, cols, WeightData::F32(values))
    }

    /// Output features
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Input features
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn data(&self) -> &WeightData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut WeightData {
        &mut self.data
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.data.to_f32()
    }
}

/// Entrada 2-D (tokens × features) observada por los hooks
#[derive(Debug, Clone)]
pub struct Activation {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Activation {
    /// Máximo de |x| por canal (columna) sobre todas las filas
    pub fn channel_abs_max(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.cols];
        if self.cols == 0 {
            return out;
        }
        for row in self.data.chunks_exact(self.cols) {
            for (m, &x) in out.iter_mut().zip(row) {
                *m = m.max(x.abs());
            }
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}

/// Modelo que puede calibrarse y reescalarse
pub trait CalibrationModel {
    /// Tamaño del vocabulario de entrada
    fn vocab_size(&self) -> usize;

    /// Todas las capas lineales en orden de recorrido (incluida la cabeza)
    fn linear_layers(&self) -> Vec<String>;

    fn weight(&self, layer: &str) -> Option<&WeightTensor>;

    fn weight_mut(&mut self, layer: &str) -> Option<&mut WeightTensor>;

    /// Registro de observadores de entrada por capa
    fn hooks_mut(&mut self) -> &mut HookRegistry;

    /// Forward de inferencia (no modifica pesos)
    fn forward(&mut self, tokens: &[u32]) -> Result<Vec<f32>, ModelError>;

    /// Liberación de memoria best-effort entre muestras
    fn release_cache(&mut self) {}

    /// Capas elegibles para SmoothQuant, en orden de recorrido
    fn eligible_layers(&self) -> Vec<String> {
        self.linear_layers()
            .into_iter()
            .filter(|name| is_eligible_layer(name))
            .collect()
    }
}
