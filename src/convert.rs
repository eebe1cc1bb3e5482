// src/convert.rs
// ============================================================================
// EXTERNAL CONVERTER - Lanza el conversor safetensors → GGUF
// ============================================================================

use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::MergeConfig;
use crate::error::PipelineError;

/// `<program> <leading_args...> <model_dir> --outfile <dest> --outtype <type>`
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalConverter {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ExternalConverter {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self { program: program.into(), leading_args }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(config.converter_program.clone(), config.converter_args.clone())
    }

    pub fn command(&self, model_dir: &Path, outfile: &Path, outtype: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(model_dir)
            .arg("--outfile")
            .arg(outfile)
            .arg("--outtype")
            .arg(outtype)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Ejecuta y espera. Estado distinto de cero → ConversionFailed.
    pub fn run(&self, model_dir: &Path, outfile: &Path, outtype: &str) -> Result<(), PipelineError> {
        log::info!(
            "Running converter: {} {} {} --outfile {} --outtype {}",
            self.program,
            self.leading_args.join(" "),
            model_dir.display(),
            outfile.display(),
            outtype
        );

        let status = self
            .command(model_dir, outfile, outtype)
            .status()
            .map_err(|source| PipelineError::ConverterSpawn {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(PipelineError::ConversionFailed(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_arguments() {
        let conv = ExternalConverter::new("python3", vec!["convert_hf_to_gguf.py".into()]);
        let cmd = conv.command(Path::new("/m"), Path::new("/m/out.gguf"), "f16");
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "python3");
        assert_eq!(args, vec!["convert_hf_to_gguf.py", "/m", "--outfile", "/m/out.gguf", "--outtype", "f16"]);
    }

    #[test]
    fn test_spawn_failure() {
        let conv = ExternalConverter::new("definitely-not-a-real-converter-binary", vec![]);
        let err = conv.run(Path::new("."), Path::new("x.gguf"), "f16").unwrap_err();
        assert!(matches!(err, PipelineError::ConverterSpawn { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_conversion_failure() {
        let conv = ExternalConverter::new("false", vec![]);
        let err = conv.run(Path::new("."), Path::new("x.gguf"), "f16").unwrap_err();
        assert!(matches!(err, PipelineError::ConversionFailed(_)));
    }
}
