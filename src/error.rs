// src/error.rs
// ============================================================================
// ERRORES DEL PIPELINE - Fallos de precondición con código de salida propio
// ============================================================================

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Errores de alto nivel que el CLI distingue por código de salida.
///
/// El resto de fallos viajan como `anyhow::Error` y terminan con código 1.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("SmoothQuant scales file not found: {0} (run `calibrate` on the model first)")]
    MissingScaleFile(PathBuf),

    #[error("External conversion failed with {0}")]
    ConversionFailed(ExitStatus),

    #[error("Cannot launch converter '{program}': {source}")]
    ConverterSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Container not found after conversion: {0}")]
    MissingContainer(PathBuf),
}

impl PipelineError {
    pub const EXIT_MISSING_SCALES: i32 = 2;
    pub const EXIT_CONVERSION: i32 = 3;

    /// Código de salida del proceso para este fallo
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingScaleFile(_) => Self::EXIT_MISSING_SCALES,
            Self::ConversionFailed(_) | Self::ConverterSpawn { .. } | Self::MissingContainer(_) => {
                Self::EXIT_CONVERSION
            }
        }
    }
}

/// Código de salida para cualquier error que llegue a `main`
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_code_missing_scales() {
        let err: anyhow::Error = PipelineError::MissingScaleFile(PathBuf::from("x.json")).into();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_exit_code_through_context() {
        let res: anyhow::Result<()> = Err(PipelineError::MissingContainer(PathBuf::from("m.gguf")))
            .context("convert step");
        assert_eq!(exit_code_for(&res.unwrap_err()), 3);
    }

    #[test]
    fn test_exit_code_generic() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&err), 1);
    }
}
