// src/safetensor/mod.rs
// ============================================================================
// SAFETENSOR - Carpetas de modelo HuggingFace (uno o varios shards)
// ============================================================================
//
// Layout:  u64 LE header_len | header JSON | datos
// Los offsets del header son relativos al inicio de los datos.
//
// ============================================================================

pub mod writer;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use serde::Deserialize;

pub use writer::SafetensorWriter;

/// Tope del header JSON (el formato lo limita a 100 MB)
pub const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

/// Bytes por elemento de un dtype safetensors
pub fn dtype_size(dtype: &str) -> Option<usize> {
    Some(match dtype {
        "BOOL" | "U8" | "I8" | "F8_E4M3" | "F8_E5M2" => 1,
        "U16" | "I16" | "F16" | "BF16" => 2,
        "U32" | "I32" | "F32" => 4,
        "U64" | "I64" | "F64" => 8,
        _ => return None,
    })
}

/// Entrada del header
#[derive(Debug, Clone, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    pub fn byte_len(&self) -> usize {
        self.data_offsets[1] - self.data_offsets[0]
    }
}

/// Un shard mapeado en memoria
pub struct SafetensorFile {
    path: PathBuf,
    tensors: BTreeMap<String, TensorInfo>,
    data_start: usize,
    mmap: Mmap,
}

impl SafetensorFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("Cannot open {}", path.display()))?;
        // SAFETY: solo lectura, el archivo no se modifica mientras está mapeado
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < 8 {
            bail!("{} is too small to be a safetensors file", path.display());
        }
        let header_len = LittleEndian::read_u64(&mmap[..8]);
        if header_len > MAX_HEADER_LEN || 8 + header_len > mmap.len() as u64 {
            bail!("Invalid safetensors header length {} in {}", header_len, path.display());
        }
        let data_start = 8 + header_len as usize;

        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&mmap[8..data_start])
            .with_context(|| format!("Invalid safetensors header JSON in {}", path.display()))?;

        let data_len = mmap.len() - data_start;
        let mut tensors = BTreeMap::new();
        for (name, value) in raw {
            if name == "__metadata__" {
                continue;
            }
            let info: TensorInfo = serde_json::from_value(value)
                .with_context(|| format!("Bad header entry '{}' in {}", name, path.display()))?;
            Self::check(&name, &info, data_len)
                .with_context(|| format!("Corrupt tensor in {}", path.display()))?;
            tensors.insert(name, info);
        }

        Ok(Self { path, tensors, data_start, mmap })
    }

    /// Offsets dentro de los datos y longitud coherente con dtype × shape
    fn check(name: &str, info: &TensorInfo, data_len: usize) -> Result<()> {
        let [start, end] = info.data_offsets;
        if start > end || end > data_len {
            bail!("Tensor '{}' has offsets {}..{} outside data section ({} bytes)", name, start, end, data_len);
        }
        if let Some(elem) = dtype_size(&info.dtype) {
            let expected = info.shape.iter().product::<usize>() * elem;
            if expected != end - start {
                bail!(
                    "Tensor '{}' ({} {:?}) needs {} bytes, header gives {}",
                    name, info.dtype, info.shape, expected, end - start
                );
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    /// Bytes crudos del tensor
    pub fn read_raw(&self, name: &str) -> Result<&[u8]> {
        let info = self.tensors.get(name)
            .ok_or_else(|| anyhow!("Tensor '{}' not found in {}", name, self.path.display()))?;
        let [start, end] = info.data_offsets;
        Ok(&self.mmap[self.data_start + start..self.data_start + end])
    }
}

/// Todos los shards de una carpeta, indexados por nombre de tensor
pub struct SafetensorReader {
    files: Vec<SafetensorFile>,
    index: BTreeMap<String, usize>,
}

impl SafetensorReader {
    pub fn from_folder(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Cannot read model folder {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |e| e == "safetensors"))
            .collect();
        if paths.is_empty() {
            bail!("No .safetensors files in {}", dir.display());
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        let mut index = BTreeMap::new();
        for (idx, path) in paths.iter().enumerate() {
            let file = SafetensorFile::open(path)?;
            for name in file.tensor_names() {
                if index.insert(name.to_string(), idx).is_some() {
                    bail!("Tensor '{}' appears in more than one shard of {}", name, dir.display());
                }
            }
            files.push(file);
        }

        log::debug!("Indexed {} tensors from {} shard(s) in {}", index.len(), files.len(), dir.display());
        Ok(Self { files, index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Nombres en orden lexicográfico
    pub fn tensor_names(&self) -> Vec<&str> {
        self.index.keys().map(|s| s.as_str()).collect()
    }

    fn file_of(&self, name: &str) -> Option<&SafetensorFile> {
        self.index.get(name).map(|&i| &self.files[i])
    }

    pub fn read_raw(&self, name: &str) -> Result<&[u8]> {
        self.file_of(name)
            .ok_or_else(|| anyhow!("Tensor '{}' not found", name))?
            .read_raw(name)
    }

    pub fn tensor_info(&self, name: &str) -> Option<&TensorInfo> {
        self.file_of(name)?.tensor_info(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensor_info(name).map(|info| info.shape.as_slice())
    }

    pub fn dtype(&self, name: &str) -> Option<&str> {
        self.tensor_info(name).map(|info| info.dtype.as_str())
    }
}
