// src/gguf/reader.rs
// ============================================================================
// GGUF READER - Header, metadata e índice de tensores sobre mmap
// ============================================================================
//
// Layout:
//   magic "GGUF" | version u32 | n_tensors u64 | n_kv u64
//   n_kv × (key string, type u32, value)
//   n_tensors × (name string, n_dims u32, dims u64[n], type u32, offset u64)
//   padding hasta `alignment`
//   datos de tensores (offsets relativos a este punto)
//
// ============================================================================

use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;

use super::types::*;

/// Resultado de parsear un contenedor (sin los datos)
#[derive(Debug, Clone, PartialEq)]
pub struct GgufLayout {
    pub version: u32,
    pub alignment: u32,
    pub kvs: Vec<GgufKv>,
    pub tensors: Vec<GgufTensorInfo>,
    /// Offset absoluto del inicio de la sección de datos
    pub data_offset: u64,
}

impl GgufLayout {
    /// Parsea header, metadata e índice. Valida que todo tensor cabe en `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let file_len = bytes.len() as u64;
        let mut cur = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        if &magic != GGUF_MAGIC {
            return Err(GgufError::BadMagic(magic));
        }

        let version = cur.read_u32::<LittleEndian>()?;
        if !(GGUF_VERSION_MIN..=GGUF_VERSION_MAX).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let n_tensors = cur.read_u64::<LittleEndian>()?;
        let n_kv = cur.read_u64::<LittleEndian>()?;

        // Cada entrada ocupa al menos 8 bytes; evita reservas absurdas
        check_count(&cur, n_kv, 8)?;
        let mut kvs = Vec::with_capacity(n_kv as usize);
        let mut seen = HashSet::new();
        for _ in 0..n_kv {
            let key = read_string(&mut cur)?;
            let ty = GgufValueType::from_u32(cur.read_u32::<LittleEndian>()?)?;
            let value = read_value(&mut cur, ty)?;
            if !seen.insert(key.clone()) {
                return Err(GgufError::DuplicateKey(key));
            }
            kvs.push(GgufKv { key, value });
        }

        let alignment = kvs
            .iter()
            .find(|kv| kv.key == ALIGNMENT_KEY)
            .and_then(|kv| kv.value.as_u32())
            .filter(|a| *a > 0 && a.is_power_of_two())
            .unwrap_or(DEFAULT_ALIGNMENT);

        check_count(&cur, n_tensors, 8)?;
        let mut tensors = Vec::with_capacity(n_tensors as usize);
        let mut names = HashSet::new();
        for _ in 0..n_tensors {
            let name = read_string(&mut cur)?;
            let n_dims = cur.read_u32::<LittleEndian>()?;
            check_count(&cur, n_dims as u64, 8)?;
            let dims = (0..n_dims)
                .map(|_| cur.read_u64::<LittleEndian>())
                .collect::<std::io::Result<Vec<u64>>>()?;
            let ggml_type = GgmlType(cur.read_u32::<LittleEndian>()?);
            let offset = cur.read_u64::<LittleEndian>()?;
            if !names.insert(name.clone()) {
                return Err(GgufError::DuplicateTensor(name));
            }
            tensors.push(GgufTensorInfo { name, dims, ggml_type, offset, size: 0 });
        }

        let data_offset = align_up(cur.position(), alignment as u64);
        if let Some(first) = tensors.first() {
            if data_offset > file_len {
                return Err(GgufError::TensorOutOfBounds {
                    name: first.name.clone(),
                    offset: first.offset,
                    size: 0,
                    file_len,
                });
            }
        }
        resolve_sizes(&mut tensors, data_offset, file_len)?;

        Ok(Self { version, alignment, kvs, tensors, data_offset })
    }
}

/// Tamaño exacto si conocemos el tipo; si no, distancia al siguiente offset
fn resolve_sizes(tensors: &mut [GgufTensorInfo], data_offset: u64, file_len: u64) -> Result<()> {
    let data_len = file_len.saturating_sub(data_offset);

    let mut offsets: Vec<u64> = tensors.iter().map(|t| t.offset).collect();
    offsets.sort_unstable();
    offsets.dedup();

    for t in tensors.iter_mut() {
        let numel = t.numel().ok_or_else(|| GgufError::ShapeOverflow(t.name.clone()))?;
        t.size = match t.ggml_type.byte_size(numel) {
            Some(size) => size,
            None => {
                let next = offsets.iter().copied().find(|&o| o > t.offset).unwrap_or(data_len);
                next.saturating_sub(t.offset)
            }
        };

        let end = t.offset.checked_add(t.size);
        if t.offset > data_len || end.map_or(true, |e| e > data_len) {
            return Err(GgufError::TensorOutOfBounds {
                name: t.name.clone(),
                offset: t.offset,
                size: t.size,
                file_len,
            });
        }
    }
    Ok(())
}

fn remaining(cur: &Cursor<&[u8]>) -> u64 {
    (cur.get_ref().len() as u64).saturating_sub(cur.position())
}

fn check_count(cur: &Cursor<&[u8]>, count: u64, min_elem: u64) -> Result<()> {
    let rem = remaining(cur);
    if count.saturating_mul(min_elem) > rem {
        return Err(GgufError::ArrayTooLarge { len: count, remaining: rem });
    }
    Ok(())
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cur.read_u64::<LittleEndian>()?;
    if len > MAX_STRING_LEN {
        return Err(GgufError::StringTooLarge(len));
    }
    if len > remaining(cur) {
        return Err(GgufError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    let mut buf = vec![0u8; len as usize];
    cur.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| GgufError::InvalidUtf8)
}

fn min_encoded_size(ty: GgufValueType) -> u64 {
    match ty {
        GgufValueType::U8 | GgufValueType::I8 | GgufValueType::Bool => 1,
        GgufValueType::U16 | GgufValueType::I16 => 2,
        GgufValueType::U32 | GgufValueType::I32 | GgufValueType::F32 => 4,
        GgufValueType::U64 | GgufValueType::I64 | GgufValueType::F64 | GgufValueType::String => 8,
        GgufValueType::Array => 12,
    }
}

fn read_value(cur: &mut Cursor<&[u8]>, ty: GgufValueType) -> Result<GgufValue> {
    Ok(match ty {
        GgufValueType::U8 => GgufValue::U8(cur.read_u8()?),
        GgufValueType::I8 => GgufValue::I8(cur.read_i8()?),
        GgufValueType::U16 => GgufValue::U16(cur.read_u16::<LittleEndian>()?),
        GgufValueType::I16 => GgufValue::I16(cur.read_i16::<LittleEndian>()?),
        GgufValueType::U32 => GgufValue::U32(cur.read_u32::<LittleEndian>()?),
        GgufValueType::I32 => GgufValue::I32(cur.read_i32::<LittleEndian>()?),
        GgufValueType::F32 => GgufValue::F32(cur.read_f32::<LittleEndian>()?),
        GgufValueType::Bool => GgufValue::Bool(cur.read_u8()? != 0),
        GgufValueType::String => GgufValue::String(read_string(cur)?),
        GgufValueType::U64 => GgufValue::U64(cur.read_u64::<LittleEndian>()?),
        GgufValueType::I64 => GgufValue::I64(cur.read_i64::<LittleEndian>()?),
        GgufValueType::F64 => GgufValue::F64(cur.read_f64::<LittleEndian>()?),
        GgufValueType::Array => {
            let elem_type = GgufValueType::from_u32(cur.read_u32::<LittleEndian>()?)?;
            let len = cur.read_u64::<LittleEndian>()?;
            check_count(cur, len, min_encoded_size(elem_type))?;
            let items = (0..len)
                .map(|_| read_value(cur, elem_type))
                .collect::<Result<Vec<_>>>()?;
            GgufValue::Array(GgufArray { elem_type, items })
        }
    })
}

/// Contenedor GGUF abierto con mmap
pub struct GgufFile {
    path: PathBuf,
    layout: GgufLayout,
    mmap: Mmap,
}

impl GgufFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: solo lectura; el archivo no se modifica mientras está mapeado
        // (el merge escribe en un temporal y renombra tras soltar el mapa).
        let mmap = unsafe { Mmap::map(&file)? };
        let layout = GgufLayout::parse(&mmap)?;
        Ok(Self { path, layout, mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &GgufLayout {
        &self.layout
    }

    pub fn version(&self) -> u32 {
        self.layout.version
    }

    pub fn alignment(&self) -> u32 {
        self.layout.alignment
    }

    pub fn kvs(&self) -> &[GgufKv] {
        &self.layout.kvs
    }

    pub fn kv(&self, key: &str) -> Option<&GgufValue> {
        self.layout.kvs.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
    }

    pub fn tensors(&self) -> &[GgufTensorInfo] {
        &self.layout.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&GgufTensorInfo> {
        self.layout.tensors.iter().find(|t| t.name == name)
    }

    /// Bytes crudos del tensor (límites ya validados al parsear)
    pub fn tensor_data(&self, info: &GgufTensorInfo) -> &[u8] {
        let start = (self.layout.data_offset + info.offset) as usize;
        &self.mmap[start..start + info.size as usize]
    }

    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::writer::GgufWriter;
    use byteorder::WriteBytesExt;

    fn sample() -> Vec<u8> {
        let mut w = GgufWriter::new(Vec::new(), DEFAULT_ALIGNMENT);
        w.add_kv(GgufKv::new("general.name", GgufValue::String("demo".into())));
        w.add_kv(GgufKv::new("general.file_type", GgufValue::U32(1)));
        w.add_kv(GgufKv::new(
            "tokenizer.ggml.tokens",
            GgufValue::Array(GgufArray::strings(["<s>", "</s>", "a"])),
        ));
        w.add_tensor("weight.A", vec![4], GgmlType::F16, &[1, 2, 3, 4, 5, 6, 7, 8]);
        w.add_tensor("weight.B", vec![1], GgmlType::F32, &[9, 9, 9, 9]);
        w.finish().unwrap()
    }

    #[test]
    fn test_parse_written_container() {
        let bytes = sample();
        let layout = GgufLayout::parse(&bytes).unwrap();

        assert_eq!(layout.version, GGUF_VERSION);
        assert_eq!(layout.alignment, 32);
        assert_eq!(layout.data_offset % 32, 0);
        assert_eq!(layout.kvs[0].key, "general.name");
        assert_eq!(layout.kvs[0].value.as_str(), Some("demo"));
        assert_eq!(layout.kvs[2].value.as_array().unwrap().len(), 3);

        assert_eq!(layout.tensors.len(), 2);
        assert_eq!(layout.tensors[0].size, 8);
        assert_eq!(layout.tensors[1].offset % 32, 0);
        let a = &layout.tensors[0];
        let start = (layout.data_offset + a.offset) as usize;
        assert_eq!(&bytes[start..start + 8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    /// Contenedor sin metadata con un tensor F32 en offset 0 y sin relleno
    fn single_tensor_unpadded(dims: &[u64]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(GGUF_MAGIC);
        b.write_u32::<LittleEndian>(GGUF_VERSION).unwrap();
        b.write_u64::<LittleEndian>(1).unwrap();
        b.write_u64::<LittleEndian>(0).unwrap();
        b.write_u64::<LittleEndian>(1).unwrap();
        b.push(b't');
        b.write_u32::<LittleEndian>(dims.len() as u32).unwrap();
        for &d in dims {
            b.write_u64::<LittleEndian>(d).unwrap();
        }
        b.write_u32::<LittleEndian>(GgmlType::F32.0).unwrap();
        b.write_u64::<LittleEndian>(0).unwrap();
        b
    }

    #[test]
    fn test_data_section_past_eof_rejected() {
        let bytes = single_tensor_unpadded(&[0]);
        assert_eq!(bytes.len(), 57);
        assert!(matches!(GgufLayout::parse(&bytes), Err(GgufError::TensorOutOfBounds { .. })));

        let mut padded = bytes.clone();
        padded.resize(64, 0);
        let layout = GgufLayout::parse(&padded).unwrap();
        assert_eq!(layout.data_offset, 64);
        assert_eq!(layout.tensors[0].size, 0);
    }

    #[test]
    fn test_overflowing_dims_rejected() {
        let mut bytes = single_tensor_unpadded(&[u64::MAX, 2]);
        bytes.resize(128, 0);
        assert!(matches!(GgufLayout::parse(&bytes), Err(GgufError::ShapeOverflow(_))));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample();
        bytes[0] = b'X';
        assert!(matches!(GgufLayout::parse(&bytes), Err(GgufError::BadMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample();
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(GgufLayout::parse(&bytes), Err(GgufError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let bytes = sample();
        let cut = &bytes[..bytes.len() - 2];
        assert!(matches!(
            GgufLayout::parse(cut),
            Err(GgufError::TensorOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_huge_array_count_rejected() {
        // header + una clave con array de 2^40 u8
        let mut b = Vec::new();
        b.extend_from_slice(GGUF_MAGIC);
        b.extend_from_slice(&3u32.to_le_bytes());
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&1u64.to_le_bytes());
        b.extend_from_slice(&1u64.to_le_bytes());
        b.push(b'k');
        b.extend_from_slice(&9u32.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&(1u64 << 40).to_le_bytes());
        assert!(matches!(GgufLayout::parse(&b), Err(GgufError::ArrayTooLarge { .. })));
    }

    #[test]
    fn test_open_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        std::fs::write(&path, sample()).unwrap();

        let file = GgufFile::open(&path).unwrap();
        assert_eq!(file.kv("general.name").and_then(|v| v.as_str()), Some("demo"));
        let b = file.tensor("weight.B").unwrap().clone();
        assert_eq!(file.tensor_data(&b), &[9, 9, 9, 9]);
        assert!(file.kv("missing").is_none());
    }
}
