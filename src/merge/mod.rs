// src/merge/mod.rs
// ============================================================================
// CONTAINER METADATA MERGER - Inyecta escalas SmoothQuant en un GGUF
// ============================================================================
//
// 1. Abre el GGUF original (mmap, solo lectura)
// 2. Copia campos general.* / tokenizer.* de tipo string o array
// 3. Añade smoothquant.{enabled, version, layer_names, scales}
// 4. Copia todos los tensores byte a byte, en orden
// 5. Escribe en <stem>.tmp.gguf, fsync, rename sobre el original
//
// Si algo falla antes del rename, el original queda intacto y el temporal
// se borra. Un solo escritor por contenedor: el rename no toma lock.
//
// ============================================================================

pub mod verify;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use xxhash_rust::xxh3::xxh3_64;

use crate::gguf::{GgufArray, GgufFile, GgufKv, GgufValue, GgufWriter};
use crate::scales::ScaleSet;

pub use verify::{ContainerVerifier, FieldReport, VerificationReport};

pub const SMOOTHQUANT_PREFIX: &str = "smoothquant.";
pub const KEY_ENABLED: &str = "smoothquant.enabled";
pub const KEY_VERSION: &str = "smoothquant.version";
pub const KEY_LAYER_NAMES: &str = "smoothquant.layer_names";
pub const KEY_SCALES: &str = "smoothquant.scales";

pub const DEFAULT_SCALE_VERSION: &str = "1.0";
pub const TEMP_SUFFIX: &str = ".tmp.gguf";

/// Namespaces que siempre se copian
pub const BASE_NAMESPACES: [&str; 2] = ["general.", "tokenizer."];

// ============================================================================
// FIELD FILTER
// ============================================================================

/// Decide qué campos del origen pasan al contenedor nuevo
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    namespaces: Vec<String>,
}

impl Default for FieldFilter {
    fn default() -> Self {
        Self {
            namespaces: BASE_NAMESPACES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FieldFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Añade namespaces extra ("llama." o "llama" valen igual)
    pub fn with_namespaces<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for ns in extra {
            let ns = ns.as_ref().trim();
            if ns.is_empty() {
                continue;
            }
            let ns = if ns.ends_with('.') { ns.to_string() } else { format!("{}.", ns) };
            if !self.namespaces.contains(&ns) {
                self.namespaces.push(ns);
            }
        }
        self
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Namespace permitido y valor string o array
    pub fn accepts(&self, key: &str, value: &GgufValue) -> bool {
        let in_namespace = self.namespaces.iter().any(|ns| key.starts_with(ns.as_str()));
        in_namespace && matches!(value, GgufValue::String(_) | GgufValue::Array(_))
    }
}

// ============================================================================
// SINK
// ============================================================================

/// Destino del temporal. `sync` debe dejar los bytes en disco.
pub trait DurableWrite: Write {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DurableWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub copied_fields: Vec<String>,
    pub skipped_fields: Vec<String>,
    pub tensor_count: usize,
    pub layer_count: usize,
    pub scale_count: usize,
    /// (nombre, xxh3 del payload) en orden de contenedor
    pub tensor_fingerprints: Vec<(String, u64)>,
    pub bytes_written: u64,
}

// ============================================================================
// MERGER
// ============================================================================

#[derive(Debug, Clone)]
pub struct ContainerMetadataMerger {
    filter: FieldFilter,
    version: String,
}

impl Default for ContainerMetadataMerger {
    fn default() -> Self {
        Self {
            filter: FieldFilter::default(),
            version: DEFAULT_SCALE_VERSION.to_string(),
        }
    }
}

impl ContainerMetadataMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// `model.gguf` → `model.tmp.gguf` en el mismo directorio
    pub fn temp_path(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".to_string());
        path.with_file_name(format!("{}{}", stem, TEMP_SUFFIX))
    }

    /// Los cuatro campos smoothquant.*
    pub fn injected_fields(&self, scales: &ScaleSet) -> Vec<GgufKv> {
        let (names, values) = scales.flatten();
        vec![
            GgufKv::new(KEY_ENABLED, GgufValue::String("true".to_string())),
            GgufKv::new(KEY_VERSION, GgufValue::String(self.version.clone())),
            GgufKv::new(KEY_LAYER_NAMES, GgufValue::Array(GgufArray::strings(names))),
            GgufKv::new(KEY_SCALES, GgufValue::Array(GgufArray::f32s(&values))),
        ]
    }

    /// Merge con reemplazo atómico del archivo en `path`
    pub fn merge(&self, path: impl AsRef<Path>, scales: &ScaleSet) -> Result<MergeReport> {
        self.merge_with(path, scales, |tmp| File::create(tmp))
    }

    /// Como `merge`, pero el sink del temporal lo abre `open_sink`
    pub fn merge_with<W, F>(&self, path: impl AsRef<Path>, scales: &ScaleSet, open_sink: F) -> Result<MergeReport>
    where
        W: DurableWrite,
        F: FnOnce(&Path) -> io::Result<W>,
    {
        let path = path.as_ref();
        scales.validate().context("Refusing to merge invalid scales")?;

        let source = GgufFile::open(path)
            .with_context(|| format!("Cannot read container {}", path.display()))?;

        let mut report = MergeReport {
            tensor_count: source.tensors().len(),
            layer_count: scales.len(),
            scale_count: scales.total_values(),
            ..Default::default()
        };

        let mut fields = Vec::new();
        for kv in source.kvs() {
            if self.filter.accepts(&kv.key, &kv.value) && !kv.key.starts_with(SMOOTHQUANT_PREFIX) {
                report.copied_fields.push(kv.key.clone());
                fields.push(kv.clone());
            } else {
                report.skipped_fields.push(kv.key.clone());
            }
        }
        fields.extend(self.injected_fields(scales));

        report.tensor_fingerprints = source
            .tensors()
            .iter()
            .map(|t| (t.name.clone(), xxh3_64(source.tensor_data(t))))
            .collect();

        log::info!(
            "Merging {}: {} fields copied, {} skipped, {} tensors, {} layers / {} scale values",
            path.display(),
            report.copied_fields.len(),
            report.skipped_fields.len(),
            report.tensor_count,
            report.layer_count,
            report.scale_count
        );

        let tmp = Self::temp_path(path);
        let written = Self::write_temp(&source, fields, &tmp, open_sink);
        drop(source);

        report.bytes_written = match written {
            Ok(n) => n,
            Err(e) => {
                discard_temp(&tmp);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&tmp, path) {
            discard_temp(&tmp);
            return Err(e).with_context(|| format!("Cannot replace {}", path.display()));
        }

        log::info!("Container updated: {} ({} bytes)", path.display(), report.bytes_written);
        Ok(report)
    }

    fn write_temp<W, F>(source: &GgufFile, fields: Vec<GgufKv>, tmp: &Path, open_sink: F) -> Result<u64>
    where
        W: DurableWrite,
        F: FnOnce(&Path) -> io::Result<W>,
    {
        let sink = open_sink(tmp).with_context(|| format!("Cannot create {}", tmp.display()))?;
        let mut writer = GgufWriter::new(CountingWriter::new(BufWriter::new(sink)), source.alignment());

        for kv in fields {
            writer.add_kv(kv);
        }
        for t in source.tensors() {
            writer.add_tensor(t.name.clone(), t.dims.clone(), t.ggml_type, source.tensor_data(t));
        }

        let counting = writer
            .finish()
            .with_context(|| format!("Cannot write {}", tmp.display()))?;
        let written = counting.count;
        let mut sink = counting
            .inner
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("Cannot flush {}", tmp.display()))?;
        sink.sync().with_context(|| format!("Cannot sync {}", tmp.display()))?;
        Ok(written)
    }
}

fn discard_temp(tmp: &Path) {
    match fs::remove_file(tmp) {
        Ok(()) => log::debug!("Removed temporary {}", tmp.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Cannot remove temporary {}: {}", tmp.display(), e),
    }
}

/// Cuenta los bytes que pasan por el writer
struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
