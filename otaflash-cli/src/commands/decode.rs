//! Decode command implementation.

use {
    crate::{Cli, commands::print_json},
    anyhow::{Context, Result, bail},
    console::style,
    otaflash::{Assembly, assemble, payload_size},
    std::{fs, path::Path},
};

fn summary_json(path: &Path, assembly: &Assembly) -> serde_json::Value {
    let mismatches: Vec<serde_json::Value> = assembly
        .mismatches
        .iter()
        .map(|m| {
            serde_json::json!({
                "record": m.index,
                "offset": m.offset,
                "address": format!("0x{:04X}", m.address),
                "declared": format!("0x{:02X}", m.declared),
                "computed": format!("0x{:02X}", m.computed),
            })
        })
        .collect();

    serde_json::json!({
        "file": path.display().to_string(),
        "records": assembly.records,
        "data_records": assembly.data_records,
        "size": assembly.image.size(),
        "checksum_ok": !assembly.has_checksum_error(),
        "mismatches": mismatches,
    })
}

/// Decode command implementation.
///
/// Fails when the file cannot be decoded or any record has a bad checksum.
pub(crate) fn cmd_decode(cli: &Cli, file: &Path, json: bool, dump: bool) -> Result<()> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let expected = payload_size(&text).with_context(|| format!("Failed to decode {}", file.display()))?;
    let assembly = assemble(&text).with_context(|| format!("Failed to decode {}", file.display()))?;
    if assembly.image.size() != expected {
        bail!(
            "pre-sized {expected} bytes but assembled {}",
            assembly.image.size()
        );
    }

    if !json && !cli.quiet {
        eprintln!(
            "{} {}",
            style("📦").cyan(),
            style(file.display()).bold()
        );
        eprintln!(
            "  {} {} records, {} data records",
            style("•").dim(),
            assembly.records,
            assembly.data_records
        );
        eprintln!(
            "  {} payload: {} bytes",
            style("•").dim(),
            assembly.image.size()
        );
    }
    for m in &assembly.mismatches {
        eprintln!(
            "  {} record {} @ 0x{:04X} (offset {}): declared {:02X}, computed {:02X}",
            style("✗").red(),
            m.index,
            m.address,
            m.offset,
            m.declared,
            m.computed
        );
    }
    if dump && !json {
        print!("{}", assembly.image.hex_dump());
    }

    if assembly.has_checksum_error() {
        bail!(
            "{} records failed checksum validation",
            assembly.mismatches.len()
        );
    }

    if json {
        print_json(&summary_json(file, &assembly))?;
    } else if !cli.quiet {
        eprintln!("{} Checksums OK", style("✓").green());
    }
    Ok(())
}
