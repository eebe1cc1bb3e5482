// src/merge/verify.rs
// ============================================================================
// CONTAINER VERIFIER - Relee el GGUF final y comprueba los campos inyectados
// ============================================================================
//
// Nunca modifica el archivo. Las discrepancias se reportan como avisos.
//
// ============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use xxhash_rust::xxh3::xxh3_64;

use super::{MergeReport, KEY_ENABLED, KEY_LAYER_NAMES, KEY_SCALES, KEY_VERSION};
use crate::gguf::{GgufFile, GgufValue};

/// Estado de un campo esperado
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReport {
    pub name: String,
    pub present: bool,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationReport {
    pub fields: Vec<FieldReport>,
    pub issues: Vec<String>,
}

impl VerificationReport {
    /// Todos los campos presentes y sin discrepancias
    pub fn is_complete(&self) -> bool {
        self.fields.iter().all(|f| f.present) && self.issues.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldReport> {
        self.fields.iter().find(|f| f.name == name)
    }
}

fn describe(value: &GgufValue) -> String {
    match value {
        GgufValue::String(s) => s.clone(),
        GgufValue::Array(a) => format!("{} entries", a.len()),
        other => other.to_string(),
    }
}

pub struct ContainerVerifier;

impl ContainerVerifier {
    /// Comprueba presencia de smoothquant.* en el contenedor
    pub fn verify(path: impl AsRef<Path>) -> Result<VerificationReport> {
        let file = Self::open(path.as_ref())?;
        Ok(Self::inspect(&file))
    }

    /// Además compara conteos y huellas de tensores con el merge
    pub fn verify_against(path: impl AsRef<Path>, expected: &MergeReport) -> Result<VerificationReport> {
        let file = Self::open(path.as_ref())?;
        let mut report = Self::inspect(&file);

        let layers = file.kv(KEY_LAYER_NAMES).and_then(|v| v.as_array()).map(|a| a.len());
        if let Some(n) = layers {
            if n != expected.layer_count {
                report.issues.push(format!("{} has {} entries, expected {}", KEY_LAYER_NAMES, n, expected.layer_count));
            }
        }

        let scales = file.kv(KEY_SCALES).and_then(|v| v.as_array()).map(|a| a.len());
        if let Some(n) = scales {
            if n != expected.scale_count {
                report.issues.push(format!("{} has {} entries, expected {}", KEY_SCALES, n, expected.scale_count));
            }
        }

        if file.tensors().len() != expected.tensor_fingerprints.len() {
            report.issues.push(format!(
                "tensor count {} differs from source {}",
                file.tensors().len(),
                expected.tensor_fingerprints.len()
            ));
        }
        for (name, hash) in &expected.tensor_fingerprints {
            match file.tensor(name) {
                Some(t) if xxh3_64(file.tensor_data(t)) == *hash => {}
                Some(_) => report.issues.push(format!("tensor '{}' payload changed", name)),
                None => report.issues.push(format!("tensor '{}' missing", name)),
            }
        }

        for issue in &report.issues {
            log::warn!("Verification: {}", issue);
        }
        Ok(report)
    }

    fn open(path: &Path) -> Result<GgufFile> {
        GgufFile::open(path).with_context(|| format!("Cannot open {} for verification", path.display()))
    }

    fn inspect(file: &GgufFile) -> VerificationReport {
        let fields = [KEY_ENABLED, KEY_VERSION, KEY_LAYER_NAMES, KEY_SCALES]
            .iter()
            .map(|&name| match file.kv(name) {
                Some(value) => FieldReport {
                    name: name.to_string(),
                    present: true,
                    description: describe(value),
                },
                None => {
                    log::warn!("Verification: field '{}' not found", name);
                    FieldReport {
                        name: name.to_string(),
                        present: false,
                        description: "missing".to_string(),
                    }
                }
            })
            .collect();

        VerificationReport { fields, issues: Vec::new() }
    }
}
