// src/bin/inspect.rs
// ============================================================================
// GGUF INSPECTOR - Metadata, tensores y campos SmoothQuant de un GGUF
// ============================================================================
//
// Uso: sq-inspect modelo.gguf [--fields] [--tensors]
//
// ============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use smoothquant_gguf::gguf::{GgufFile, GgufValue};
use smoothquant_gguf::merge::{ContainerVerifier, SMOOTHQUANT_PREFIX};

#[derive(Parser)]
#[command(name = "sq-inspect")]
#[command(about = "Inspect GGUF metadata and SmoothQuant fields")]
struct Args {
    /// GGUF file to inspect
    file: PathBuf,

    /// List every metadata field
    #[arg(long)]
    fields: bool,

    /// List every tensor
    #[arg(long)]
    tensors: bool,
}

/// Elementos de array que se muestran antes de truncar
const ARRAY_PREVIEW: usize = 6;

/// Tamaño legible en unidades binarias
fn format_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if size == 0 {
        return "vacío".to_string();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    match unit {
        0 => format!("{} B", size),
        3 => format!("{:.2} GB", value),
        _ => format!("{:.1} {}", value, UNITS[unit]),
    }
}

/// Barra proporcional al tensor más grande; al menos un bloque si hay datos
fn make_bar(size: u64, max_size: u64, width: usize) -> String {
    let filled = match (size, max_size) {
        (0, _) | (_, 0) => 0,
        _ => ((size.min(max_size) as u128 * width as u128 / max_size as u128) as usize).max(1),
    };
    format!("{}{}", "█".repeat(filled), "░".repeat(width.saturating_sub(filled)))
}

fn preview(value: &GgufValue) -> String {
    match value {
        GgufValue::Array(arr) => {
            let shown: Vec<String> = arr.items.iter().take(ARRAY_PREVIEW).map(|v| v.to_string()).collect();
            let more = if arr.len() > ARRAY_PREVIEW { ", …" } else { "" };
            format!("[{}{}] ({} × {:?})", shown.join(", "), more, arr.len(), arr.elem_type)
        }
        GgufValue::String(s) if s.chars().count() > 60 => {
            let head: String = s.chars().take(57).collect();
            format!("{:?}…", head)
        }
        other => other.to_string(),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let file = GgufFile::open(&args.file)
        .with_context(|| format!("Cannot open {}", args.file.display()))?;

    println!();
    println!("════════════════════════════════════════════════════════════════════════════════");
    println!("  GGUF INSPECTOR");
    println!("════════════════════════════════════════════════════════════════════════════════");
    println!("  Archivo:      {}", args.file.display());
    println!("  Tamaño real:  {}", format_size(file.file_size()));
    println!("  Versión:      {}", file.version());
    println!("  Alineación:   {}", file.alignment());
    println!("  Campos:       {}", file.kvs().len());
    println!("  Tensores:     {}", file.tensors().len());
    println!("  Datos desde:  0x{:X}", file.layout().data_offset);
    println!();

    // SmoothQuant
    let report = ContainerVerifier::verify(&args.file)?;
    println!("┌──────────────────────────────────────────────────────────────────────────────┐");
    println!("│ SMOOTHQUANT                                                                  │");
    println!("├──────────────────────────────────────────────────────────────────────────────┤");
    for field in &report.fields {
        let mark = if field.present { "✓" } else { "✗" };
        println!("│  {} {:28} {:45} │", mark, field.name, field.description);
    }
    println!("└──────────────────────────────────────────────────────────────────────────────┘");
    println!();

    if args.fields {
        println!("┌──────────────────────────────────────────────────────────────────────────────┐");
        println!("│ METADATA                                                                     │");
        println!("├──────────────────────────────────────────────────────────────────────────────┤");
        for kv in file.kvs() {
            let tag = if kv.key.starts_with(SMOOTHQUANT_PREFIX) { "*" } else { " " };
            println!("│ {}{:36} {}", tag, kv.key, preview(&kv.value));
        }
        println!("└──────────────────────────────────────────────────────────────────────────────┘");
        println!();
    }

    if args.tensors {
        let max_size = file.tensors().iter().map(|t| t.size).max().unwrap_or(0);
        println!("┌──────────────────────────────────────────────────────────────────────────────┐");
        println!("│ TENSORES                                                                     │");
        println!("├──────────────────────────────────────────────────────────────────────────────┤");
        for t in file.tensors() {
            let dims: Vec<String> = t.dims.iter().map(|d| d.to_string()).collect();
            println!(
                "│  {:40} {:6} [{:>14}] {} {:>10}",
                t.name,
                t.ggml_type.name(),
                dims.join("×"),
                make_bar(t.size, max_size, 12),
                format_size(t.size)
            );
        }
        println!("└──────────────────────────────────────────────────────────────────────────────┘");
        println!();
    }

    let total: u64 = file.tensors().iter().map(|t| t.size).sum();
    println!("  Datos de tensores: {}", format_size(total));
    if report.is_complete() {
        println!("  ✓ SmoothQuant metadata presente");
    } else {
        println!("  ⚠ SmoothQuant metadata incompleta");
    }
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_units() {
        assert_eq!(format_size(0), "vacío");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
        assert_eq!(format_size(5 << 30), "5.00 GB");
    }

    #[test]
    fn test_make_bar() {
        assert_eq!(make_bar(0, 10, 4), "░░░░");
        assert_eq!(make_bar(10, 10, 4), "████");
        assert_eq!(make_bar(1, 1000, 4), "█░░░");
        assert_eq!(make_bar(5, 10, 4), "██░░");
        assert_eq!(make_bar(20, 10, 4).chars().count(), 4);
    }
}
