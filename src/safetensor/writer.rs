// src/safetensor/writer.rs
// ============================================================================
// SAFETENSOR WRITER - Guarda el modelo suavizado
// ============================================================================
//
// Layout: [u64 LE header_len][header JSON][datos]
// El header se rellena con espacios hasta múltiplo de 8.
//
// ============================================================================

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

struct PendingTensor {
    dtype: String,
    shape: Vec<usize>,
    data: Vec<u8>,
}

/// Acumula tensores y los escribe en un único archivo
#[derive(Default)]
pub struct SafetensorWriter {
    tensors: BTreeMap<String, PendingTensor>,
}

impl SafetensorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Añade un tensor con bytes ya codificados en `dtype`
    pub fn add_raw(&mut self, name: &str, dtype: &str, shape: &[usize], data: Vec<u8>) {
        self.tensors.insert(name.to_string(), PendingTensor {
            dtype: dtype.to_string(),
            shape: shape.to_vec(),
            data,
        });
    }

    pub fn add_f32(&mut self, name: &str, shape: &[usize], values: &[f32]) {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_raw(name, "F32", shape, data);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let mut header = serde_json::Map::new();
        header.insert("__metadata__".to_string(), json!({ "format": "pt" }));

        let mut offset = 0usize;
        for (name, t) in &self.tensors {
            let end = offset + t.data.len();
            header.insert(name.clone(), json!({
                "dtype": t.dtype,
                "shape": t.shape,
                "data_offsets": [offset, end],
            }));
            offset = end;
        }

        let mut header_bytes = serde_json::to_vec(&Value::Object(header))?;
        while header_bytes.len() % 8 != 0 {
            header_bytes.push(b' ');
        }

        let file = File::create(path)
            .with_context(|| format!("Cannot create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        out.write_all(&header_bytes)?;
        for t in self.tensors.values() {
            out.write_all(&t.data)?;
        }
        out.flush()?;

        Ok(())
    }
}
