// src/gguf/writer.rs
// ============================================================================
// GGUF WRITER - Serializa metadata + índice + datos (v3)
// ============================================================================

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use super::types::*;

struct PendingTensor<'a> {
    name: String,
    dims: Vec<u64>,
    ggml_type: GgmlType,
    data: &'a [u8],
}

/// Acumula metadata y tensores; `finish` escribe todo en orden.
/// Los tensores se toman prestados (típicamente del mmap de origen).
pub struct GgufWriter<'a, W: Write> {
    out: W,
    alignment: u32,
    kvs: Vec<GgufKv>,
    tensors: Vec<PendingTensor<'a>>,
    current_offset: u64,
}

impl<'a, W: Write> GgufWriter<'a, W> {
    pub fn new(out: W, alignment: u32) -> Self {
        let alignment = if alignment > 0 && alignment.is_power_of_two() {
            alignment
        } else {
            DEFAULT_ALIGNMENT
        };
        Self {
            out,
            alignment,
            kvs: Vec::new(),
            tensors: Vec::new(),
            current_offset: 0,
        }
    }

    /// Añade o reemplaza (manteniendo posición) un campo
    pub fn add_kv(&mut self, kv: GgufKv) {
        match self.kvs.iter_mut().find(|k| k.key == kv.key) {
            Some(existing) => existing.value = kv.value,
            None => self.kvs.push(kv),
        }
    }

    pub fn add_tensor(&mut self, name: impl Into<String>, dims: Vec<u64>, ggml_type: GgmlType, data: &'a [u8]) {
        self.tensors.push(PendingTensor { name: name.into(), dims, ggml_type, data });
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.current_offset += bytes.len() as u64;
        Ok(())
    }

    /// Rellena con ceros hasta múltiplo de la alineación
    fn align(&mut self) -> Result<()> {
        let target = align_up(self.current_offset, self.alignment as u64);
        let padding = (target - self.current_offset) as usize;
        if padding > 0 {
            self.put(&vec![0u8; padding])?;
        }
        Ok(())
    }

    /// Escribe el contenedor completo y devuelve el sink
    pub fn finish(mut self) -> Result<W> {
        if self.alignment != DEFAULT_ALIGNMENT {
            self.add_kv(GgufKv::new(ALIGNMENT_KEY, GgufValue::U32(self.alignment)));
        }

        {
            let mut seen = std::collections::HashSet::new();
            for t in &self.tensors {
                if !seen.insert(t.name.as_str()) {
                    return Err(GgufError::DuplicateTensor(t.name.clone()));
                }
                let numel = checked_numel(&t.dims).ok_or_else(|| GgufError::ShapeOverflow(t.name.clone()))?;
                if let Some(expected) = t.ggml_type.byte_size(numel) {
                    if expected != t.data.len() as u64 {
                        return Err(GgufError::TensorSizeMismatch {
                            name: t.name.clone(),
                            ggml_type: t.ggml_type,
                            expected,
                            got: t.data.len() as u64,
                        });
                    }
                }
            }
        }

        // Header
        let mut head = Vec::with_capacity(24);
        head.extend_from_slice(GGUF_MAGIC);
        head.write_u32::<LittleEndian>(GGUF_VERSION)?;
        head.write_u64::<LittleEndian>(self.tensors.len() as u64)?;
        head.write_u64::<LittleEndian>(self.kvs.len() as u64)?;
        self.put(&head)?;

        // Metadata
        let mut buf = Vec::new();
        for kv in &self.kvs {
            write_string(&mut buf, &kv.key)?;
            buf.write_u32::<LittleEndian>(kv.value.value_type().as_u32())?;
            write_value(&mut buf, &kv.value)?;
        }
        self.put(&buf)?;

        // Índice de tensores con offsets alineados
        let mut buf = Vec::new();
        let mut data_cursor = 0u64;
        for t in &self.tensors {
            data_cursor = align_up(data_cursor, self.alignment as u64);
            write_string(&mut buf, &t.name)?;
            buf.write_u32::<LittleEndian>(t.dims.len() as u32)?;
            for &d in &t.dims {
                buf.write_u64::<LittleEndian>(d)?;
            }
            buf.write_u32::<LittleEndian>(t.ggml_type.0)?;
            buf.write_u64::<LittleEndian>(data_cursor)?;
            data_cursor += t.data.len() as u64;
        }
        self.put(&buf)?;

        // Datos
        let tensors = std::mem::take(&mut self.tensors);
        for t in &tensors {
            self.align()?;
            self.put(t.data)?;
        }

        self.out.flush()?;
        Ok(self.out)
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() as u64 > MAX_STRING_LEN {
        return Err(GgufError::StringTooLarge(s.len() as u64));
    }
    out.write_u64::<LittleEndian>(s.len() as u64)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_value(out: &mut Vec<u8>, value: &GgufValue) -> Result<()> {
    match value {
        GgufValue::U8(v) => out.write_u8(*v)?,
        GgufValue::I8(v) => out.write_i8(*v)?,
        GgufValue::U16(v) => out.write_u16::<LittleEndian>(*v)?,
        GgufValue::I16(v) => out.write_i16::<LittleEndian>(*v)?,
        GgufValue::U32(v) => out.write_u32::<LittleEndian>(*v)?,
        GgufValue::I32(v) => out.write_i32::<LittleEndian>(*v)?,
        GgufValue::F32(v) => out.write_f32::<LittleEndian>(*v)?,
        GgufValue::Bool(v) => out.write_u8(u8::from(*v))?,
        GgufValue::String(s) => write_string(out, s)?,
        GgufValue::U64(v) => out.write_u64::<LittleEndian>(*v)?,
        GgufValue::I64(v) => out.write_i64::<LittleEndian>(*v)?,
        GgufValue::F64(v) => out.write_f64::<LittleEndian>(*v)?,
        GgufValue::Array(arr) => {
            out.write_u32::<LittleEndian>(arr.elem_type.as_u32())?;
            out.write_u64::<LittleEndian>(arr.items.len() as u64)?;
            for item in &arr.items {
                if item.value_type() != arr.elem_type {
                    return Err(GgufError::ArrayTypeMismatch {
                        expected: arr.elem_type,
                        got: item.value_type(),
                    });
                }
                write_value(out, item)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::reader::GgufLayout;

    #[test]
    fn test_metadata_roundtrip_all_types() {
        let kvs = vec![
            GgufKv::new("a.u8", GgufValue::U8(7)),
            GgufKv::new("a.i8", GgufValue::I8(-7)),
            GgufKv::new("a.u16", GgufValue::U16(700)),
            GgufKv::new("a.i16", GgufValue::I16(-700)),
            GgufKv::new("a.u32", GgufValue::U32(70_000)),
            GgufKv::new("a.i32", GgufValue::I32(-70_000)),
            GgufKv::new("a.f32", GgufValue::F32(0.5)),
            GgufKv::new("a.bool", GgufValue::Bool(true)),
            GgufKv::new("a.str", GgufValue::String("héllo".into())),
            GgufKv::new("a.u64", GgufValue::U64(1 << 40)),
            GgufKv::new("a.i64", GgufValue::I64(-(1 << 40))),
            GgufKv::new("a.f64", GgufValue::F64(-2.25)),
            GgufKv::new("a.nested", GgufValue::Array(GgufArray {
                elem_type: GgufValueType::Array,
                items: vec![GgufValue::Array(GgufArray::f32s(&[1.0, 2.0]))],
            })),
        ];

        let mut w = GgufWriter::new(Vec::new(), DEFAULT_ALIGNMENT);
        for kv in &kvs {
            w.add_kv(kv.clone());
        }
        let bytes = w.finish().unwrap();
        let layout = GgufLayout::parse(&bytes).unwrap();
        assert_eq!(layout.kvs, kvs);
    }

    #[test]
    fn test_custom_alignment_written() {
        let data = [1u8; 4];
        let mut w = GgufWriter::new(Vec::new(), 64);
        w.add_tensor("t", vec![1], GgmlType::F32, &data);
        let bytes = w.finish().unwrap();
        let layout = GgufLayout::parse(&bytes).unwrap();
        assert_eq!(layout.alignment, 64);
        assert_eq!(layout.data_offset % 64, 0);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let data = [0u8; 3];
        let mut w = GgufWriter::new(Vec::new(), DEFAULT_ALIGNMENT);
        w.add_tensor("t", vec![2], GgmlType::F16, &data);
        assert!(matches!(w.finish(), Err(GgufError::TensorSizeMismatch { .. })));
    }

    #[test]
    fn test_mixed_array_rejected() {
        let mut w = GgufWriter::new(Vec::new(), DEFAULT_ALIGNMENT);
        w.add_kv(GgufKv::new("x", GgufValue::Array(GgufArray {
            elem_type: GgufValueType::U32,
            items: vec![GgufValue::U32(1), GgufValue::F32(1.0)],
        })));
        assert!(matches!(w.finish(), Err(GgufError::ArrayTypeMismatch { .. })));
    }

    #[test]
    fn test_add_kv_replaces_in_place() {
        let mut w = GgufWriter::new(Vec::new(), DEFAULT_ALIGNMENT);
        w.add_kv(GgufKv::new("a", GgufValue::U32(1)));
        w.add_kv(GgufKv::new("b", GgufValue::U32(2)));
        w.add_kv(GgufKv::new("a", GgufValue::U32(3)));
        let bytes = w.finish().unwrap();
        let layout = GgufLayout::parse(&bytes).unwrap();
        assert_eq!(layout.kvs[0], GgufKv::new("a", GgufValue::U32(3)));
        assert_eq!(layout.kvs.len(), 2);
    }
}
