// src/model/feedforward.rs
// ============================================================================
// FEED-FORWARD MODEL - Modelo de referencia cargado desde safetensors
// ============================================================================
//
// Estructura:
//   embedding [vocab, hidden] → capa_0 → SiLU → capa_1 → ... → capa_n → lm_head
//
// Las capas lineales son los tensores 2-D "*.weight" que no son embedding
// ni cabeza, en orden natural de nombre (layers.2 < layers.10).
// El resto de tensores (norms, biases) se conservan tal cual al guardar.
//
// ============================================================================

use std::cmp::Ordering;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use regex::Regex;

use super::hooks::HookRegistry;
use super::{Activation, CalibrationModel, ModelError, WeightData, WeightTensor};
use crate::safetensor::{SafetensorReader, SafetensorWriter};

const EMBEDDING_SUFFIXES: [&str; 2] = ["embed_tokens.weight", "wte.weight"];
const HEAD_NAME: &str = "lm_head";

/// Tensor que no participa en el forward pero se guarda con el modelo
#[derive(Debug, Clone)]
struct Passthrough {
    name: String,
    dtype: String,
    shape: Vec<usize>,
    data: Vec<u8>,
}

/// Pila de capas lineales con SiLU entre ellas
pub struct FeedForwardModel {
    embedding_name: String,
    embedding: WeightTensor,
    layers: Vec<(String, WeightTensor)>,
    head: Option<WeightTensor>,
    passthrough: Vec<Passthrough>,
    hooks: HookRegistry,
}

impl std::fmt::Debug for FeedForwardModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForwardModel")
            .field("embedding_name", &self.embedding_name)
            .field("layers", &self.layers.len())
            .field("passthrough", &self.passthrough.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ORDEN NATURAL
// ============================================================================

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NameChunk {
    Num(u64),
    Text(String),
}

fn natural_key(name: &str) -> Vec<NameChunk> {
    static CHUNKS: OnceLock<Regex> = OnceLock::new();
    let re = CHUNKS.get_or_init(|| Regex::new(r"\d+|\D+").expect("static regex"));
    re.find_iter(name)
        .map(|m| match m.as_str().parse::<u64>() {
            Ok(n) => NameChunk::Num(n),
            Err(_) => NameChunk::Text(m.as_str().to_string()),
        })
        .collect()
}

/// Compara nombres de capa tratando los dígitos como números
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}

/// Nombre de módulo a partir del nombre de tensor ("x.q_proj.weight" → "x.q_proj")
fn module_name(tensor_name: &str) -> &str {
    tensor_name.strip_suffix(".weight").unwrap_or(tensor_name)
}

// ============================================================================
// CONSTRUCCIÓN
// ============================================================================

impl FeedForwardModel {
    /// Construye el modelo validando que las capas encadenan
    pub fn new(
        embedding: WeightTensor,
        layers: Vec<(String, WeightTensor)>,
        head: Option<WeightTensor>,
    ) -> Result<Self, ModelError> {
        let mut width = embedding.cols();
        for (name, w) in &layers {
            if w.cols() != width {
                return Err(ModelError::ShapeMismatch {
                    layer: name.clone(),
                    expected: w.cols(),
                    got: width,
                });
            }
            width = w.rows();
        }
        if let Some(h) = &head {
            if h.cols() != width {
                return Err(ModelError::ShapeMismatch {
                    layer: HEAD_NAME.to_string(),
                    expected: h.cols(),
                    got: width,
                });
            }
        }

        Ok(Self {
            embedding_name: "model.embed_tokens.weight".to_string(),
            embedding,
            layers,
            head,
            passthrough: Vec::new(),
            hooks: HookRegistry::new(),
        })
    }

    /// Carga desde una carpeta de safetensors (uno o varios shards)
    pub fn from_folder(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let reader = SafetensorReader::from_folder(dir)?;

        let mut embedding: Option<(String, WeightTensor)> = None;
        let mut head = None;
        let mut layers = Vec::new();
        let mut passthrough = Vec::new();

        for name in reader.tensor_names() {
            let shape = reader.shape(name).unwrap_or(&[]).to_vec();
            let dtype = reader.dtype(name).unwrap_or("").to_string();
            let raw = reader.read_raw(name)?;

            let is_matrix = shape.len() == 2 && name.ends_with(".weight");
            let data = if is_matrix { WeightData::from_le_bytes(&dtype, raw) } else { None };

            let Some(data) = data else {
                passthrough.push(Passthrough {
                    name: name.to_string(),
                    dtype,
                    shape,
                    data: raw.to_vec(),
                });
                continue;
            };

            let tensor = WeightTensor::new(name, shape[0], shape[1], data)?;
            if EMBEDDING_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                embedding = Some((name.to_string(), tensor));
            } else if name.contains(HEAD_NAME) {
                head = Some(tensor);
            } else {
                layers.push((module_name(name).to_string(), tensor));
            }
        }

        let (embedding_name, embedding) = embedding
            .ok_or_else(|| anyhow!("No embedding tensor (*embed_tokens.weight) in {}", dir.display()))?;

        layers.sort_by(|a, b| natural_cmp(&a.0, &b.0));

        let mut model = Self::new(embedding, layers, head)
            .with_context(|| format!("Layers in {} do not form a chain", dir.display()))?;
        model.embedding_name = embedding_name;
        model.passthrough = passthrough;

        log::info!(
            "Loaded model from {}: vocab {}, hidden {}, {} linear layers{}",
            dir.display(),
            model.vocab_size(),
            model.hidden_size(),
            model.layers.len(),
            if model.head.is_some() { " + lm_head" } else { "" },
        );

        Ok(model)
    }

    /// Guarda todos los tensores en `<dir>/model.safetensors` con su dtype original
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;

        let mut writer = SafetensorWriter::new();
        writer.add_raw(
            &self.embedding_name,
            self.embedding.data().dtype(),
            &self.embedding.shape(),
            self.embedding.data().to_le_bytes(),
        );
        for (name, w) in &self.layers {
            writer.add_raw(&format!("{}.weight", name), w.data().dtype(), &w.shape(), w.data().to_le_bytes());
        }
        if let Some(h) = &self.head {
            writer.add_raw("lm_head.weight", h.data().dtype(), &h.shape(), h.data().to_le_bytes());
        }
        for p in &self.passthrough {
            writer.add_raw(&p.name, &p.dtype, &p.shape, p.data.clone());
        }

        writer.write(dir.join("model.safetensors"))
    }

    pub fn hidden_size(&self) -> usize {
        self.embedding.cols()
    }
}

// ============================================================================
// FORWARD
// ============================================================================

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// y = x · Wᵀ   con x [rows, in], W [out, in]
fn linear(x: &[f32], rows: usize, w: &WeightTensor) -> Vec<f32> {
    let (out_f, in_f) = (w.rows(), w.cols());
    let wf = w.to_f32();
    let mut y = vec![0.0f32; rows * out_f];
    for r in 0..rows {
        let xr = &x[r * in_f..(r + 1) * in_f];
        for o in 0..out_f {
            let wr = &wf[o * in_f..(o + 1) * in_f];
            y[r * out_f + o] = xr.iter().zip(wr).map(|(a, b)| a * b).sum();
        }
    }
    y
}

impl CalibrationModel for FeedForwardModel {
    fn vocab_size(&self) -> usize {
        self.embedding.rows()
    }

    fn linear_layers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.layers.iter().map(|(n, _)| n.clone()).collect();
        if self.head.is_some() {
            names.push(HEAD_NAME.to_string());
        }
        names
    }

    fn weight(&self, layer: &str) -> Option<&WeightTensor> {
        if layer == HEAD_NAME {
            return self.head.as_ref();
        }
        self.layers.iter().find(|(n, _)| n == layer).map(|(_, w)| w)
    }

    fn weight_mut(&mut self, layer: &str) -> Option<&mut WeightTensor> {
        if layer == HEAD_NAME {
            return self.head.as_mut();
        }
        self.layers.iter_mut().find(|(n, _)| n == layer).map(|(_, w)| w)
    }

    fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    fn forward(&mut self, tokens: &[u32]) -> Result<Vec<f32>, ModelError> {
        if tokens.is_empty() {
            return Err(ModelError::EmptyInput);
        }

        let vocab = self.vocab_size();
        let hidden = self.hidden_size();
        let table = self.embedding.to_f32();

        let rows = tokens.len();
        let mut x = Vec::with_capacity(rows * hidden);
        for &t in tokens {
            let t_idx = t as usize;
            if t_idx >= vocab {
                return Err(ModelError::TokenOutOfRange { token: t, vocab });
            }
            x.extend_from_slice(&table[t_idx * hidden..(t_idx + 1) * hidden]);
        }

        let n_layers = self.layers.len();
        let mut width = hidden;
        for (i, (name, w)) in self.layers.iter().enumerate() {
            let act = Activation { rows, cols: width, data: x };
            if !act.is_finite() {
                return Err(ModelError::NonFinite { layer: name.clone() });
            }
            self.hooks.notify(name, &act);

            x = linear(&act.data, rows, w);
            if i + 1 < n_layers {
                x.iter_mut().for_each(|v| *v = silu(*v));
            }
            width = w.rows();
        }

        if let Some(head) = &self.head {
            let act = Activation { rows, cols: width, data: x };
            if !act.is_finite() {
                return Err(ModelError::NonFinite { layer: HEAD_NAME.to_string() });
            }
            self.hooks.notify(HEAD_NAME, &act);
            x = linear(&act.data, rows, head);
        }

        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use tempfile::tempdir;

    fn tiny_model() -> FeedForwardModel {
        let embedding = WeightTensor::from_f32("emb", 4, 2, vec![
            0.0, 0.0,
            1.0, -1.0,
            2.0, 0.5,
            -3.0, 1.0,
        ]).unwrap();
        let l0 = WeightTensor::from_f32("l0", 3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let l1 = WeightTensor::from_f32("l1", 2, 3, vec![1.0; 6]).unwrap();
        let head = WeightTensor::from_f32("head", 4, 2, vec![0.5; 8]).unwrap();
        FeedForwardModel::new(
            embedding,
            vec![("layers.0.up".to_string(), l0), ("layers.1.down".to_string(), l1)],
            Some(head),
        )
        .unwrap()
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["layers.10.a", "layers.2.a", "layers.1.b"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["layers.1.b", "layers.2.a", "layers.10.a"]);
    }

    #[test]
    fn test_chain_validation() {
        let embedding = WeightTensor::from_f32("emb", 4, 2, vec![0.0; 8]).unwrap();
        let bad = WeightTensor::from_f32("l0", 3, 5, vec![0.0; 15]).unwrap();
        let res = FeedForwardModel::new(embedding, vec![("l0".to_string(), bad)], None);
        assert!(matches!(res, Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_gated_mlp_folder_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = SafetensorWriter::new();
        writer.add_f32("model.embed_tokens.weight", &[4, 2], &[0.1; 8]);
        writer.add_f32("model.layers.0.mlp.gate_proj.weight", &[3, 2], &[0.0; 6]);
        writer.add_f32("model.layers.0.mlp.up_proj.weight", &[3, 2], &[0.0; 6]);
        writer.write(dir.path().join("model.safetensors")).unwrap();

        let err = FeedForwardModel::from_folder(dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("do not form a chain"));
    }

    #[test]
    fn test_forward_shapes_and_layers() {
        let mut model = tiny_model();
        assert_eq!(model.linear_layers(), vec!["layers.0.up", "layers.1.down", "lm_head"]);
        assert_eq!(model.eligible_layers(), vec!["layers.0.up", "layers.1.down"]);

        let logits = model.forward(&[1, 2, 3]).unwrap();
        assert_eq!(logits.len(), 3 * 4);
    }

    #[test]
    fn test_forward_faults() {
        let mut model = tiny_model();
        assert!(matches!(model.forward(&[]), Err(ModelError::EmptyInput)));
        assert!(matches!(model.forward(&[9]), Err(ModelError::TokenOutOfRange { token: 9, .. })));
    }

    #[test]
    fn test_save_and_reload_keeps_dtype() {
        let dir = tempdir().unwrap();
        let mut writer = SafetensorWriter::new();
        writer.add_f32("model.embed_tokens.weight", &[4, 2], &[0.1; 8]);
        let w: Vec<u8> = (0..6).flat_map(|i| f16::from_f32(i as f32).to_le_bytes()).collect();
        writer.add_raw("model.layers.0.mlp.up_proj.weight", "F16", &[3, 2], w);
        writer.add_f32("model.norm.weight", &[3], &[1.0; 3]);
        writer.write(dir.path().join("model.safetensors")).unwrap();

        let model = FeedForwardModel::from_folder(dir.path()).unwrap();
        assert_eq!(model.linear_layers(), vec!["model.layers.0.mlp.up_proj"]);
        let w = model.weight("model.layers.0.mlp.up_proj").unwrap();
        assert_eq!(w.data().dtype(), "F16");

        let out = tempdir().unwrap();
        model.save(out.path()).unwrap();
        let reloaded = SafetensorReader::from_folder(out.path()).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.dtype("model.layers.0.mlp.up_proj.weight"), Some("F16"));
        let norm = WeightData::from_le_bytes("F32", reloaded.read_raw("model.norm.weight").unwrap()).unwrap();
        assert_eq!(norm.to_f32(), vec![1.0; 3]);
    }
}
