// src/smooth/profiler.rs
// ============================================================================
// ACTIVATION PROFILER - Máximos por canal a la entrada de cada capa lineal
// ============================================================================
//
// 1. Adjunta un observador a cada capa elegible (todas menos lm_head)
// 2. Ejecuta forward sobre N/4 muestras del corpus
// 3. Un fallo en una muestra se registra y se salta
// 4. Los observadores se retiran siempre (InstrumentationScope)
// 5. Las capas sin ningún batch se descartan
//
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;

use indicatif::{ProgressBar, ProgressStyle};

use super::corpus::{calibration_budget, CalibrationCorpus};
use crate::config::HOUSEKEEPING_INTERVAL;
use crate::model::{Activation, CalibrationModel, InstrumentationScope};

/// capa → vectores de máximos por canal, uno por batch.
/// El orden de capas es el orden de recorrido del modelo.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationRecord {
    layers: Vec<(String, Vec<Vec<f32>>)>,
}

impl ActivationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con las capas ya declaradas (sin batches)
    pub fn with_layers(names: &[String]) -> Self {
        Self {
            layers: names.iter().map(|n| (n.clone(), Vec::new())).collect(),
        }
    }

    /// Añade un batch; declara la capa si no existía
    pub fn push(&mut self, layer: &str, channel_max: Vec<f32>) {
        match self.layers.iter_mut().find(|(name, _)| name == layer) {
            Some((_, batches)) => batches.push(channel_max),
            None => self.layers.push((layer.to_string(), vec![channel_max])),
        }
    }

    pub fn batches(&self, layer: &str) -> Option<&[Vec<f32>]> {
        self.layers.iter().find(|(name, _)| name == layer).map(|(_, b)| b.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Vec<f32>])> {
        self.layers.iter().map(|(name, b)| (name.as_str(), b.as_slice()))
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Elimina capas sin batches y devuelve sus nombres
    pub fn drop_empty(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        self.layers.retain(|(name, batches)| {
            if batches.is_empty() {
                dropped.push(name.clone());
                false
            } else {
                true
            }
        });
        dropped
    }
}

/// Resumen de una pasada de calibración
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileStats {
    pub requested: usize,
    pub budget: usize,
    pub processed: usize,
    pub failed: usize,
    pub dropped_layers: Vec<String>,
}

pub struct ActivationProfiler {
    show_progress: bool,
}

impl Default for ActivationProfiler {
    fn default() -> Self {
        Self { show_progress: true }
    }
}

impl ActivationProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template("  Calibrating [{bar:40}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█░ ");
        pb.set_style(style);
        pb
    }

    /// Recorre el corpus y devuelve el registro de activaciones
    pub fn profile<M: CalibrationModel + ?Sized>(
        &self,
        model: &mut M,
        corpus: &CalibrationCorpus,
    ) -> (ActivationRecord, ProfileStats) {
        let eligible = model.eligible_layers();
        let budget = calibration_budget(corpus.len());
        let mut stats = ProfileStats {
            requested: corpus.len(),
            budget,
            ..Default::default()
        };

        log::info!(
            "Profiling {} layers on {} of {} samples",
            eligible.len(), budget, corpus.len()
        );

        let record = Rc::new(RefCell::new(ActivationRecord::with_layers(&eligible)));

        {
            let mut scope = InstrumentationScope::new(model);
            for layer in &eligible {
                let sink = Rc::clone(&record);
                let name = layer.clone();
                scope.attach(layer, Box::new(move |input: &Activation| {
                    sink.borrow_mut().push(&name, input.channel_abs_max());
                }));
            }
            log::debug!("{} input observers attached", scope.active());

            let pb = self.progress_bar(budget);
            for (i, tokens) in corpus.samples().iter().take(budget).enumerate() {
                match scope.forward(tokens) {
                    Ok(_) => stats.processed += 1,
                    Err(e) => {
                        log::warn!("Error in calibration sample {}: {}", i, e);
                        stats.failed += 1;
                    }
                }
                if i > 0 && i % HOUSEKEEPING_INTERVAL == 0 {
                    scope.release_cache();
                }
                pb.inc(1);
            }
            pb.finish_and_clear();
        }

        let mut record = match Rc::try_unwrap(record) {
            Ok(cell) => cell.into_inner(),
            Err(shared) => shared.borrow().clone(),
        };

        stats.dropped_layers = record.drop_empty();
        for layer in &stats.dropped_layers {
            log::warn!("Layer '{}' collected no activations; it will not be smoothed", layer);
        }

        log::info!(
            "Calibration done: {} ok, {} failed, {} layers with statistics",
            stats.processed, stats.failed, record.len()
        );

        (record, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedForwardModel, WeightTensor};

    fn model() -> FeedForwardModel {
        let embedding = WeightTensor::from_f32("emb", 5, 2, vec![
            0.0, 0.0,
            1.0, -2.0,
            -3.0, 0.5,
            0.25, 4.0,
            1.0, 1.0,
        ]).unwrap();
        let l0 = WeightTensor::from_f32("l0", 3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let l1 = WeightTensor::from_f32("l1", 2, 3, vec![0.5; 6]).unwrap();
        let head = WeightTensor::from_f32("head", 5, 2, vec![1.0; 10]).unwrap();
        FeedForwardModel::new(
            embedding,
            vec![("l0".to_string(), l0), ("l1".to_string(), l1)],
            Some(head),
        )
        .unwrap()
    }

    #[test]
    fn test_records_channel_max_per_batch() {
        let mut m = model();
        let corpus = CalibrationCorpus::from_samples(vec![
            vec![1, 2], vec![3], vec![4], vec![1],
            vec![1, 2, 3], vec![2], vec![3], vec![4],
        ]);
        let profiler = ActivationProfiler::new().with_progress(false);
        let (record, stats) = profiler.profile(&mut m, &corpus);

        assert_eq!(stats.budget, 2);
        assert_eq!(stats.processed, 2);
        assert_eq!(record.layer_names(), vec!["l0", "l1"]);
        let b = record.batches("l0").unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b[0], vec![3.0, 2.0]);
        assert_eq!(b[1], vec![0.25, 4.0]);
        assert_eq!(record.batches("l1").unwrap()[0].len(), 3);
        assert!(record.batches("lm_head").is_none());
    }

    #[test]
    fn test_bad_sample_is_skipped_and_hooks_removed() {
        let mut m = model();
        let corpus = CalibrationCorpus::from_samples(vec![
            vec![99], vec![], vec![1], vec![2],
            vec![0], vec![0], vec![0], vec![0],
        ]);
        let (record, stats) = ActivationProfiler::new().with_progress(false).profile(&mut m, &corpus);

        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 2);
        assert!(record.is_empty());
        assert_eq!(stats.dropped_layers, vec!["l0", "l1"]);
        assert!(m.hooks_mut().is_empty());
    }

    #[test]
    fn test_partial_failure_keeps_good_batches() {
        let mut m = model();
        let mut samples = vec![vec![1], vec![42], vec![2], vec![3]];
        samples.extend(std::iter::repeat(vec![1]).take(12));
        let corpus = CalibrationCorpus::from_samples(samples);
        let (record, stats) = ActivationProfiler::new().with_progress(false).profile(&mut m, &corpus);

        assert_eq!(stats.budget, 4);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(record.batches("l0").unwrap().len(), 3);
        assert!(m.hooks_mut().is_empty());
    }

    /// Envoltorio que cuenta las llamadas a release_cache
    struct CountingModel {
        inner: FeedForwardModel,
        releases: usize,
    }

    impl CalibrationModel for CountingModel {
        fn vocab_size(&self) -> usize {
            self.inner.vocab_size()
        }

        fn linear_layers(&self) -> Vec<String> {
            self.inner.linear_layers()
        }

        fn weight(&self, layer: &str) -> Option<&crate::model::WeightTensor> {
            self.inner.weight(layer)
        }

        fn weight_mut(&mut self, layer: &str) -> Option<&mut crate::model::WeightTensor> {
            self.inner.weight_mut(layer)
        }

        fn hooks_mut(&mut self) -> &mut crate::model::HookRegistry {
            self.inner.hooks_mut()
        }

        fn forward(&mut self, tokens: &[u32]) -> Result<Vec<f32>, crate::model::ModelError> {
            self.inner.forward(tokens)
        }

        fn release_cache(&mut self) {
            self.releases += 1;
        }
    }

    #[test]
    fn test_release_cache_every_interval() {
        let mut m = CountingModel { inner: model(), releases: 0 };
        let corpus = CalibrationCorpus::from_samples(vec![vec![1]; 4 * 25]);
        let (_, stats) = ActivationProfiler::new().with_progress(false).profile(&mut m, &corpus);

        assert_eq!(stats.processed, 25);
        // muestras 10 y 20
        assert_eq!(m.releases, 25 / HOUSEKEEPING_INTERVAL);
        assert!(m.inner.hooks_mut().is_empty());
    }

    #[test]
    fn test_drop_empty() {
        let mut rec = ActivationRecord::with_layers(&["a".to_string(), "b".to_string()]);
        rec.push("b", vec![1.0]);
        assert_eq!(rec.drop_empty(), vec!["a"]);
        assert_eq!(rec.layer_names(), vec!["b"]);
    }
}
