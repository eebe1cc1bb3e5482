// src/gguf/types.rs
// ============================================================================
// GGUF TYPES - Tipos de valor de metadata y tipos de tensor GGML
// ============================================================================

use std::fmt;

use thiserror::Error;

/// Magic de todo archivo GGUF
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Versión que escribimos
pub const GGUF_VERSION: u32 = 3;
pub const GGUF_VERSION_MIN: u32 = 2;
pub const GGUF_VERSION_MAX: u32 = 3;

/// Alineación por defecto de la sección de datos
pub const DEFAULT_ALIGNMENT: u32 = 32;
pub const ALIGNMENT_KEY: &str = "general.alignment";

/// Límite de longitud de strings (claves, valores, nombres de tensor)
pub const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid metadata value type: {0}")]
    InvalidValueType(u32),

    #[error("string too large: {0} bytes")]
    StringTooLarge(u64),

    #[error("array of {len} elements does not fit in the remaining {remaining} bytes")]
    ArrayTooLarge { len: u64, remaining: u64 },

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("duplicate metadata key '{0}'")]
    DuplicateKey(String),

    #[error("duplicate tensor '{0}'")]
    DuplicateTensor(String),

    #[error("tensor '{name}' ({size} bytes at {offset}) exceeds file size {file_len}")]
    TensorOutOfBounds { name: String, offset: u64, size: u64, file_len: u64 },

    #[error("tensor '{name}' has {got} bytes, type {ggml_type} needs {expected}")]
    TensorSizeMismatch { name: String, ggml_type: GgmlType, expected: u64, got: u64 },

    #[error("tensor '{0}' has dimensions whose product overflows u64")]
    ShapeOverflow(String),

    #[error("array declares {expected:?} elements but contains {got:?}")]
    ArrayTypeMismatch { expected: GgufValueType, got: GgufValueType },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GgufError>;

/// Discriminante de tipo de valor de metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GgufValueType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl GgufValueType {
    pub fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            other => return Err(GgufError::InvalidValueType(other)),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Array tipado: todos los elementos son de `elem_type`
#[derive(Debug, Clone, PartialEq)]
pub struct GgufArray {
    pub elem_type: GgufValueType,
    pub items: Vec<GgufValue>,
}

impl GgufArray {
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            elem_type: GgufValueType::String,
            items: items.into_iter().map(|s| GgufValue::String(s.into())).collect(),
        }
    }

    pub fn f32s(items: &[f32]) -> Self {
        Self {
            elem_type: GgufValueType::F32,
            items: items.iter().map(|&v| GgufValue::F32(v)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Valor de metadata
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(GgufArray),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    pub fn value_type(&self) -> GgufValueType {
        match self {
            Self::U8(_) => GgufValueType::U8,
            Self::I8(_) => GgufValueType::I8,
            Self::U16(_) => GgufValueType::U16,
            Self::I16(_) => GgufValueType::I16,
            Self::U32(_) => GgufValueType::U32,
            Self::I32(_) => GgufValueType::I32,
            Self::F32(_) => GgufValueType::F32,
            Self::Bool(_) => GgufValueType::Bool,
            Self::String(_) => GgufValueType::String,
            Self::Array(_) => GgufValueType::Array,
            Self::U64(_) => GgufValueType::U64,
            Self::I64(_) => GgufValueType::I64,
            Self::F64(_) => GgufValueType::F64,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&GgufArray> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for GgufValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{}", v),
            Self::I8(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Array(a) => write!(f, "[{:?}; {}]", a.elem_type, a.len()),
            Self::U64(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
        }
    }
}

/// Par clave-valor de metadata
#[derive(Debug, Clone, PartialEq)]
pub struct GgufKv {
    pub key: String,
    pub value: GgufValue,
}

impl GgufKv {
    pub fn new(key: impl Into<String>, value: GgufValue) -> Self {
        Self { key: key.into(), value }
    }
}

/// Tipo de tensor GGML (discriminante en archivo)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GgmlType(pub u32);

impl GgmlType {
    pub const F32: Self = Self(0);
    pub const F16: Self = Self(1);
    pub const Q4_0: Self = Self(2);
    pub const Q8_0: Self = Self(8);
    pub const BF16: Self = Self(30);

    /// (elementos por bloque, bytes por bloque). None si no lo conocemos.
    pub fn layout(self) -> Option<(u64, u64)> {
        Some(match self.0 {
            0 => (1, 4),      // F32
            1 => (1, 2),      // F16
            2 => (32, 18),    // Q4_0
            3 => (32, 20),    // Q4_1
            6 => (32, 22),    // Q5_0
            7 => (32, 24),    // Q5_1
            8 => (32, 34),    // Q8_0
            9 => (32, 36),    // Q8_1
            10 => (256, 84),  // Q2_K
            11 => (256, 110), // Q3_K
            12 => (256, 144), // Q4_K
            13 => (256, 176), // Q5_K
            14 => (256, 210), // Q6_K
            15 => (256, 292), // Q8_K
            16 => (256, 66),  // IQ2_XXS
            17 => (256, 74),  // IQ2_XS
            18 => (256, 98),  // IQ3_XXS
            19 => (256, 50),  // IQ1_S
            20 => (32, 18),   // IQ4_NL
            21 => (256, 110), // IQ3_S
            22 => (256, 82),  // IQ2_S
            23 => (256, 136), // IQ4_XS
            24 => (1, 1),     // I8
            25 => (1, 2),     // I16
            26 => (1, 4),     // I32
            27 => (1, 8),     // I64
            28 => (1, 8),     // F64
            29 => (256, 56),  // IQ1_M
            30 => (1, 2),     // BF16
            34 => (256, 54),  // TQ1_0
            35 => (256, 66),  // TQ2_0
            _ => return None,
        })
    }

    /// Bytes que ocupan `numel` elementos (None si el tipo es desconocido
    /// o numel no es múltiplo del bloque)
    pub fn byte_size(self, numel: u64) -> Option<u64> {
        let (block, bytes) = self.layout()?;
        if numel % block != 0 {
            return None;
        }
        (numel / block).checked_mul(bytes)
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "F32",
            1 => "F16",
            2 => "Q4_0",
            3 => "Q4_1",
            6 => "Q5_0",
            7 => "Q5_1",
            8 => "Q8_0",
            9 => "Q8_1",
            10 => "Q2_K",
            11 => "Q3_K",
            12 => "Q4_K",
            13 => "Q5_K",
            14 => "Q6_K",
            15 => "Q8_K",
            24 => "I8",
            25 => "I16",
            26 => "I32",
            27 => "I64",
            28 => "F64",
            30 => "BF16",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for GgmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Descriptor de un tensor en el índice
#[derive(Debug, Clone, PartialEq)]
pub struct GgufTensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub ggml_type: GgmlType,
    /// Offset relativo al inicio de la sección de datos
    pub offset: u64,
    /// Tamaño del payload en bytes
    pub size: u64,
}

impl GgufTensorInfo {
    /// None si el producto de dimensiones desborda
    pub fn numel(&self) -> Option<u64> {
        checked_numel(&self.dims)
    }
}

pub fn checked_numel(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
}

/// Redondea `offset` al múltiplo siguiente de `alignment`
pub fn align_up(offset: u64, alignment: u64) -> u64 {
    let rem = offset % alignment;
    if rem == 0 { offset } else { offset + alignment - rem }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_codes() {
        for n in 0u32..=12 {
            assert_eq!(GgufValueType::from_u32(n).unwrap().as_u32(), n);
        }
        assert!(GgufValueType::from_u32(13).is_err());
    }

    #[test]
    fn test_numel_overflow() {
        assert_eq!(checked_numel(&[3, 4]), Some(12));
        assert_eq!(checked_numel(&[]), Some(1));
        assert_eq!(checked_numel(&[u64::MAX, 2]), None);
        assert_eq!(GgmlType::F32.byte_size(u64::MAX), None);
    }

    #[test]
    fn test_byte_sizes() {
        assert_eq!(GgmlType::F32.byte_size(10), Some(40));
        assert_eq!(GgmlType::F16.byte_size(4), Some(8));
        assert_eq!(GgmlType::Q8_0.byte_size(64), Some(68));
        assert_eq!(GgmlType::Q4_0.byte_size(33), None);
        assert_eq!(GgmlType(999).byte_size(8), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(64, 32), 64);
        assert_eq!(align_up(65, 64), 128);
    }
}
