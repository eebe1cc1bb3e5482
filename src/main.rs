// src/main.rs
// ============================================================================
// SMOOTHQUANT-GGUF CLI
// ============================================================================
//
// Calibrar y reescalar:
//   smoothquant-gguf calibrate ./Llama-2-7b -o ./Llama-2-7b-sq --alpha 0.5
//
// Convertir e inyectar escalas:
//   smoothquant-gguf convert ./Llama-2-7b-sq -o llama-sq-f16.gguf
//
// Códigos de salida: 0 ok, 2 falta scales.json, 3 falla la conversión, 1 resto
//
// ============================================================================

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};

use smoothquant_gguf::{
    config::Config,
    error::exit_code_for,
    pipeline::{run_calibration, run_conversion, CalibrateOptions, ConvertOptions},
};

#[derive(Parser, Debug)]
#[command(name = "smoothquant-gguf")]
#[command(about = "SmoothQuant calibration and GGUF scale-metadata injection")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON config file (flags override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Profile activations, rescale weights and write smoothquant_scales.json
    ///
    /// The built-in model runs its linear layers as a single chain in natural
    /// name order (embedding, layers with SiLU, optional lm_head). Checkpoints
    /// with parallel projections (attention q/k/v, gated MLPs) are not modeled
    /// and usually fail the chain check when loading.
    Calibrate {
        /// Model folder (safetensors + config)
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Output folder for the smoothed model
        #[arg(short, long)]
        output: PathBuf,

        /// Migration strength in [0, 1]
        #[arg(long)]
        alpha: Option<f32>,

        /// Calibration samples (a quarter of them are processed)
        #[arg(long)]
        samples: Option<usize>,

        /// Tokens per sample
        #[arg(long)]
        seq_len: Option<usize>,

        /// Seed for the random corpus
        #[arg(long)]
        seed: Option<u64>,

        /// JSON file with token-id sequences instead of a random corpus
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Convert a smoothed model to GGUF and inject the scales
    Convert {
        /// Smoothed model folder (must contain smoothquant_scales.json)
        #[arg(value_name = "MODEL_DIR")]
        model_dir: PathBuf,

        /// Output GGUF file
        #[arg(short, long)]
        output: PathBuf,

        /// Tensor type passed to the converter
        #[arg(long)]
        outtype: Option<String>,

        /// Converter program
        #[arg(long)]
        converter: Option<String>,

        /// Merge into an existing container without running the converter
        #[arg(long)]
        skip_conversion: bool,

        /// Extra metadata namespaces to keep (e.g. llama)
        #[arg(long = "keep-namespace", value_name = "NS")]
        keep_namespaces: Vec<String>,
    },
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(args) {
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(exit_code_for(&e));
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let start = Instant::now();

    match args.command {
        Command::Calibrate { model, output, alpha, samples, seq_len, seed, corpus, no_progress } => {
            let smooth = &mut config.smooth;
            if let Some(a) = alpha {
                smooth.alpha = a;
            }
            if let Some(n) = samples {
                smooth.n_samples = n;
            }
            if let Some(n) = seq_len {
                smooth.seq_len = n;
            }
            if let Some(s) = seed {
                smooth.seed = s;
            }

            println!("═══════════════════════════════════════════════════════════════");
            println!("  SMOOTHQUANT CALIBRATION");
            println!("═══════════════════════════════════════════════════════════════");
            println!("  Model:    {}", model.display());
            println!("  Alpha:    {}", smooth.alpha);
            println!("  Samples:  {} (seq_len {}, seed {})", smooth.n_samples, smooth.seq_len, smooth.seed);
            if let Some(c) = &corpus {
                println!("  Corpus:   {}", c.display());
            }
            println!("  Output:   {}", output.display());
            println!("═══════════════════════════════════════════════════════════════");

            let opts = CalibrateOptions {
                model_dir: model,
                output_dir: output,
                corpus,
                show_progress: !no_progress,
            };
            let stats = run_calibration(&opts, &config.smooth)?;

            println!("\n═══════════════════════════════════════════════════════════════");
            println!("  CALIBRATION COMPLETE");
            println!("═══════════════════════════════════════════════════════════════");
            println!("  Time:       {:.1}s", start.elapsed().as_secs_f64());
            println!(
                "  Samples:    {} ok, {} failed (of {} budgeted)",
                stats.profile.processed, stats.profile.failed, stats.profile.budget
            );
            println!("  Layers:     {} smoothed, {} values", stats.layers_smoothed, stats.total_scale_values);
            if !stats.profile.dropped_layers.is_empty() {
                println!("  Dropped:    {}", stats.profile.dropped_layers.join(", "));
            }
            println!("  Aux files:  {}", stats.aux_files_copied);
            println!("  Scales:     {}", stats.scales_path.display());
            println!("═══════════════════════════════════════════════════════════════");
        }

        Command::Convert { model_dir, output, outtype, converter, skip_conversion, keep_namespaces } => {
            let merge = &mut config.merge;
            if let Some(t) = outtype {
                merge.outtype = t;
            }
            if let Some(p) = converter {
                merge.converter_program = p;
            }
            merge.extra_namespaces.extend(keep_namespaces);

            println!("═══════════════════════════════════════════════════════════════");
            println!("  SMOOTHQUANT → GGUF");
            println!("═══════════════════════════════════════════════════════════════");
            println!("  Model:     {}", model_dir.display());
            println!("  Outtype:   {}", merge.outtype);
            println!("  Converter: {}", if skip_conversion { "skipped".to_string() } else { merge.converter_program.clone() });
            println!("  Output:    {}", output.display());
            println!("═══════════════════════════════════════════════════════════════");

            let opts = ConvertOptions { model_dir, output: output.clone(), skip_conversion };
            let outcome = run_conversion(&opts, &config.merge)?;

            println!("\n[VERIFY] {}", output.display());
            match &outcome.verification {
                Some(report) => {
                    for field in &report.fields {
                        let mark = if field.present { "✓" } else { "⚠" };
                        println!("  {} {}: {}", mark, field.name, field.description);
                    }
                    for issue in &report.issues {
                        println!("  ⚠ {}", issue);
                    }
                }
                None => println!("  ⚠ Verification skipped"),
            }

            println!("\n═══════════════════════════════════════════════════════════════");
            println!("  CONVERSION COMPLETE");
            println!("═══════════════════════════════════════════════════════════════");
            println!("  Time:     {:.1}s", start.elapsed().as_secs_f64());
            println!("  Fields:   {} copied, {} skipped", outcome.merge.copied_fields.len(), outcome.merge.skipped_fields.len());
            println!("  Tensors:  {}", outcome.merge.tensor_count);
            println!("  Scales:   {} layers, {} values", outcome.merge.layer_count, outcome.merge.scale_count);
            println!("  Size:     {:.1} MB", outcome.merge.bytes_written as f64 / 1024.0 / 1024.0);
            println!("  Output:   {}", output.display());
            println!("═══════════════════════════════════════════════════════════════");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_calibrate_help_mentions_chain_limit() {
        let cmd = Args::command();
        let calibrate = cmd.find_subcommand("calibrate").unwrap();
        let help = calibrate.get_long_about().unwrap().to_string();
        assert!(help.contains("parallel projections"));
    }
}
