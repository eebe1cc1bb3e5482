// src/gguf/mod.rs
// ============================================================================
// GGUF - Lectura y escritura de contenedores GGUF v2/v3
// ============================================================================

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::{GgufFile, GgufLayout};
pub use types::{
    align_up, GgmlType, GgufArray, GgufError, GgufKv, GgufTensorInfo, GgufValue, GgufValueType,
    DEFAULT_ALIGNMENT, GGUF_VERSION,
};
pub use writer::GgufWriter;
