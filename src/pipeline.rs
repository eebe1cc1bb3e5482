// src/pipeline.rs
// ============================================================================
// PIPELINE - Orquestación de calibrate y convert
// ============================================================================
//
// calibrate: modelo → perfil → escalas → reescalado → modelo + scales.json
// convert:   scales.json → conversor externo → merge → verificación
//
// Las dos fases son independientes: convert solo necesita la carpeta que
// produjo calibrate.
//
// ============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::{MergeConfig, SmoothConfig};
use crate::convert::ExternalConverter;
use crate::error::PipelineError;
use crate::merge::{ContainerMetadataMerger, ContainerVerifier, FieldFilter, MergeReport, VerificationReport};
use crate::model::{CalibrationModel, FeedForwardModel};
use crate::scales::{ScaleSet, ScaleStore};
use crate::smooth::{smooth_model, ActivationProfiler, CalibrationCorpus, ProfileStats};

/// Archivos auxiliares que acompañan al modelo suavizado
pub const AUX_FILES: [&str; 7] = [
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "tokenizer.model",
    "special_tokens_map.json",
    "vocab.json",
];

// ============================================================================
// CALIBRATE
// ============================================================================

#[derive(Debug, Clone)]
pub struct CalibrateOptions {
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    pub corpus: Option<PathBuf>,
    pub show_progress: bool,
}

#[derive(Debug, Default)]
pub struct CalibrationStats {
    pub profile: ProfileStats,
    pub layers_smoothed: usize,
    pub total_scale_values: usize,
    pub aux_files_copied: usize,
    pub scales_path: PathBuf,
}

/// Corpus de archivo o aleatorio determinista
pub fn load_corpus(corpus: Option<&Path>, config: &SmoothConfig, vocab_size: usize) -> Result<CalibrationCorpus> {
    match corpus {
        Some(path) => CalibrationCorpus::from_file(path),
        None => Ok(CalibrationCorpus::random(config.seed, config.n_samples, config.seq_len, vocab_size)),
    }
}

/// Perfila, sintetiza y reescala un modelo ya cargado
pub fn calibrate_model<M: CalibrationModel + ?Sized>(
    model: &mut M,
    corpus: &CalibrationCorpus,
    config: &SmoothConfig,
    show_progress: bool,
) -> Result<(ScaleSet, ProfileStats)> {
    let (record, profile) = ActivationProfiler::new()
        .with_progress(show_progress)
        .profile(model, corpus);

    if record.is_empty() {
        log::warn!("No layer collected activations; the model is saved unchanged");
    }

    let scales = smooth_model(model, &record, config).context("SmoothQuant failed")?;
    Ok((scales, profile))
}

pub fn run_calibration(opts: &CalibrateOptions, config: &SmoothConfig) -> Result<CalibrationStats> {
    config.validate().map_err(anyhow::Error::msg).context("Invalid SmoothQuant configuration")?;

    if same_dir(&opts.model_dir, &opts.output_dir) {
        bail!(
            "Output directory must differ from the model directory ({})",
            opts.model_dir.display()
        );
    }

    let mut model = FeedForwardModel::from_folder(&opts.model_dir)
        .with_context(|| format!("Cannot load model from {}", opts.model_dir.display()))?;

    let corpus = load_corpus(opts.corpus.as_deref(), config, model.vocab_size())?;
    let (scales, profile) = calibrate_model(&mut model, &corpus, config, opts.show_progress)?;

    model.save(&opts.output_dir)?;
    let aux_files_copied = copy_aux_files(&opts.model_dir, &opts.output_dir)?;

    let scales_path = ScaleStore::path_in(&opts.output_dir);
    ScaleStore::save(&scales, &scales_path)
        .with_context(|| format!("Cannot save scales to {}", scales_path.display()))?;

    Ok(CalibrationStats {
        profile,
        layers_smoothed: scales.len(),
        total_scale_values: scales.total_values(),
        aux_files_copied,
        scales_path,
    })
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Copia config/tokenizer existentes; devuelve cuántos
pub fn copy_aux_files(from: &Path, to: &Path) -> Result<usize> {
    let mut copied = 0;
    for name in AUX_FILES {
        let src = from.join(name);
        if !src.is_file() {
            continue;
        }
        std::fs::copy(&src, to.join(name))
            .with_context(|| format!("Cannot copy {}", src.display()))?;
        copied += 1;
    }
    Ok(copied)
}

// ============================================================================
// CONVERT
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub model_dir: PathBuf,
    pub output: PathBuf,
    pub skip_conversion: bool,
}

#[derive(Debug)]
pub struct ConversionOutcome {
    pub merge: MergeReport,
    /// None si el contenedor final no pudo releerse (solo aviso)
    pub verification: Option<VerificationReport>,
}

/// Escalas de la carpeta del modelo; su ausencia es un error de precondición
pub fn load_scales(model_dir: &Path) -> Result<ScaleSet> {
    let path = ScaleStore::path_in(model_dir);
    if !path.is_file() {
        return Err(PipelineError::MissingScaleFile(path).into());
    }
    ScaleStore::load(&path).with_context(|| format!("Cannot load scales from {}", path.display()))
}

pub fn merger_from_config(config: &MergeConfig) -> ContainerMetadataMerger {
    ContainerMetadataMerger::new()
        .with_filter(FieldFilter::new().with_namespaces(&config.extra_namespaces))
        .with_version(config.version.clone())
}

pub fn run_conversion(opts: &ConvertOptions, config: &MergeConfig) -> Result<ConversionOutcome> {
    let scales = load_scales(&opts.model_dir)?;

    if opts.skip_conversion {
        log::info!("Skipping external conversion; using {}", opts.output.display());
    } else {
        ExternalConverter::from_config(config).run(&opts.model_dir, &opts.output, &config.outtype)?;
    }

    if !opts.output.is_file() {
        return Err(PipelineError::MissingContainer(opts.output.clone()).into());
    }

    let report = merger_from_config(config).merge(&opts.output, &scales)?;

    let verification = match ContainerVerifier::verify_against(&opts.output, &report) {
        Ok(v) => {
            if !v.is_complete() {
                log::warn!("Container verification reported problems in {}", opts.output.display());
            }
            Some(v)
        }
        Err(e) => {
            log::warn!("Cannot verify {}: {:#}", opts.output.display(), e);
            None
        }
    };

    Ok(ConversionOutcome { merge: report, verification })
}
