// src/scales/mod.rs
// ============================================================================
// SCALE STORE - smoothquant_scales.json
// ============================================================================
//
// Formato:
//   {
//     "model.layers.0.self_attn.q_proj": [0.71, 1.0, ...],
//     "model.layers.0.mlp.scalar_gate": 0.5
//   }
//
// El orden de las claves es el orden de recorrido del modelo y se conserva
// al leer y al escribir. NaN/Inf nunca llegan a disco.
//
// ============================================================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const SCALES_FILE_NAME: &str = "smoothquant_scales.json";

#[derive(Debug, Error)]
pub enum ScaleStoreError {
    #[error("Non-finite scale value {value} in layer '{layer}' at index {index}")]
    NonFinite { layer: String, index: usize, value: f32 },

    #[error("Invalid scales JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Escala de una capa: escalar (tensor 0-d) o vector por canal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScaleValue {
    Scalar(f32),
    Vector(Vec<f32>),
}

impl ScaleValue {
    pub fn values(&self) -> &[f32] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Vector(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    /// (min, max) de los valores
    pub fn range(&self) -> (f32, f32) {
        self.values().iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
    }
}

/// Mapa ordenado capa → escala
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleSet {
    entries: Vec<(String, ScaleValue)>,
}

impl ScaleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserta o reemplaza (manteniendo la posición original)
    pub fn insert(&mut self, layer: impl Into<String>, value: ScaleValue) {
        let layer = layer.into();
        match self.entries.iter_mut().find(|(name, _)| *name == layer) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((layer, value)),
        }
    }

    pub fn get(&self, layer: &str) -> Option<&ScaleValue> {
        self.entries.iter().find(|(name, _)| name == layer).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScaleValue)> {
        self.entries.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Número total de valores (un escalar cuenta como 1)
    pub fn total_values(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// Codificación paralela para el contenedor: nombres + valores concatenados
    pub fn flatten(&self) -> (Vec<String>, Vec<f32>) {
        let names = self.entries.iter().map(|(name, _)| name.clone()).collect();
        let mut flat = Vec::with_capacity(self.total_values());
        for (_, v) in &self.entries {
            flat.extend_from_slice(v.values());
        }
        (names, flat)
    }

    /// Falla con la primera capa que contenga NaN/Inf
    pub fn validate(&self) -> Result<(), ScaleStoreError> {
        for (layer, v) in &self.entries {
            if let Some((index, &value)) = v.values().iter().enumerate().find(|(_, x)| !x.is_finite()) {
                return Err(ScaleStoreError::NonFinite { layer: layer.clone(), index, value });
            }
        }
        Ok(())
    }
}

impl Serialize for ScaleSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (layer, value) in &self.entries {
            map.serialize_entry(layer, value)?;
        }
        map.end()
    }
}

struct ScaleSetVisitor;

impl<'de> Visitor<'de> for ScaleSetVisitor {
    type Value = ScaleSet;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map from layer name to a number or a list of numbers")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ScaleSet, A::Error> {
        let mut set = ScaleSet::new();
        while let Some((layer, value)) = access.next_entry::<String, ScaleValue>()? {
            if set.get(&layer).is_some() {
                return Err(serde::de::Error::custom(format!("duplicate layer '{}'", layer)));
            }
            set.entries.push((layer, value));
        }
        Ok(set)
    }
}

impl<'de> Deserialize<'de> for ScaleSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ScaleSetVisitor)
    }
}

/// Persistencia de escalas en JSON legible
pub struct ScaleStore;

impl ScaleStore {
    /// Ruta del archivo de escalas dentro de un directorio de modelo
    pub fn path_in(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(SCALES_FILE_NAME)
    }

    pub fn to_json(set: &ScaleSet) -> Result<String, ScaleStoreError> {
        set.validate()?;
        Ok(serde_json::to_string_pretty(set)?)
    }

    /// Rechaza valores que no caben en f32 (serde los convierte en inf)
    pub fn from_json(text: &str) -> Result<ScaleSet, ScaleStoreError> {
        let set: ScaleSet = serde_json::from_str(text)?;
        set.validate()?;
        Ok(set)
    }

    pub fn save(set: &ScaleSet, path: impl AsRef<Path>) -> Result<(), ScaleStoreError> {
        let path = path.as_ref();
        let json = Self::to_json(set)?;
        fs::write(path, json).map_err(|source| ScaleStoreError::Io { path: path.to_path_buf(), source })?;
        log::info!("Saved {} layer scales to {}", set.len(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<ScaleSet, ScaleStoreError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ScaleStoreError::Io { path: path.to_path_buf(), source })?;
        let set = Self::from_json(&text)?;
        log::info!("Loaded {} layer scales from {}", set.len(), path.display());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ScaleSet {
        let mut set = ScaleSet::new();
        set.insert("model.layers.1.mlp.up_proj", ScaleValue::Vector(vec![0.70710677, 1.0, 1.2247449, 1e-5]));
        set.insert("model.layers.0.gate", ScaleValue::Scalar(0.333_333_34));
        set.insert("model.layers.0.q_proj", ScaleValue::Vector(vec![2.236068, 3.4028235e38]));
        set
    }

    #[test]
    fn test_roundtrip_exact_scalar_and_vector() {
        let set = sample_set();
        let json = ScaleStore::to_json(&set).unwrap();
        let back = ScaleStore::from_json(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let json = ScaleStore::to_json(&sample_set()).unwrap();
        let back = ScaleStore::from_json(&json).unwrap();
        assert_eq!(
            back.layer_names(),
            vec!["model.layers.1.mlp.up_proj", "model.layers.0.gate", "model.layers.0.q_proj"]
        );
        let first = json.find("up_proj").unwrap();
        let last = json.find("q_proj").unwrap();
        assert!(first < last);
    }

    #[test]
    fn test_scalar_serializes_as_number() {
        let mut set = ScaleSet::new();
        set.insert("a", ScaleValue::Scalar(0.5));
        set.insert("b", ScaleValue::Vector(vec![1.5, 2.0]));
        let v: serde_json::Value = serde_json::from_str(&ScaleStore::to_json(&set).unwrap()).unwrap();
        assert_eq!(v["a"], serde_json::json!(0.5));
        assert_eq!(v["b"], serde_json::json!([1.5, 2.0]));
    }

    #[test]
    fn test_non_finite_fails_loudly() {
        let mut set = ScaleSet::new();
        set.insert("ok", ScaleValue::Vector(vec![1.0]));
        set.insert("bad", ScaleValue::Vector(vec![1.0, f32::NAN]));
        match ScaleStore::to_json(&set) {
            Err(ScaleStoreError::NonFinite { layer, index, .. }) => {
                assert_eq!(layer, "bad");
                assert_eq!(index, 1);
            }
            other => panic!("expected NonFinite, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_layer_rejected() {
        assert!(ScaleStore::from_json(r#"{"a": 1.0, "a": [2.0]}"#).is_err());
    }

    #[test]
    fn test_f32_overflow_rejected_on_load() {
        let err = ScaleStore::from_json(r#"{"a": [1e39, 2.0]}"#).unwrap_err();
        assert!(matches!(err, ScaleStoreError::NonFinite { index: 0, .. }));
        assert!(ScaleStore::from_json(r#"{"b": -1e39}"#).is_err());
    }

    #[test]
    fn test_flatten() {
        let (names, flat) = sample_set().flatten();
        assert_eq!(names.len(), 3);
        assert_eq!(flat.len(), 4 + 1 + 2);
        assert_eq!(flat[4], 0.333_333_34);
    }

    #[test]
    fn test_save_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = ScaleStore::path_in(dir.path());
        let set = sample_set();
        ScaleStore::save(&set, &path).unwrap();
        assert_eq!(ScaleStore::load(&path).unwrap(), set);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut set = sample_set();
        set.insert("model.layers.0.gate", ScaleValue::Scalar(2.0));
        assert_eq!(set.len(), 3);
        assert_eq!(set.layer_names()[1], "model.layers.0.gate");
        assert_eq!(set.get("model.layers.0.gate"), Some(&ScaleValue::Scalar(2.0)));
    }
}
