//! Info command: inspect a firmware descriptor without hardware.

use anyhow::{Context, Result};
use console::style;
use pxflash::Firmware;
use std::path::Path;

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    if json {
        return cmd_info_json(firmware);
    }

    eprintln!(
        "{} Loading firmware from {}",
        style("📦").cyan(),
        firmware.display()
    );

    let fw = Firmware::from_file(firmware)
        .with_context(|| format!("failed to load firmware {}", firmware.display()))?;

    eprintln!("\n{}", style("Firmware information").bold().underlined());
    eprintln!("  Board id:        {}", fw.board_id()?);
    eprintln!("  Board revision:  {}", fw.board_revision()?);
    eprintln!("  Image size:      {} bytes", fw.image_size()?);
    eprintln!("  Padded size:     {} bytes", fw.image().len());
    eprintln!("  Image CRC:       {:#010x}", fw.crc(fw.image().len()));

    let extras: Vec<_> = fw
        .metadata()
        .filter(|(k, _)| !matches!(k.as_str(), "board_id" | "board_revision" | "image_size"))
        .collect();
    if !extras.is_empty() {
        eprintln!("\n{}", style("Additional metadata").bold().underlined());
        for (key, value) in extras {
            eprintln!("  {key}: {value}");
        }
    }

    Ok(())
}

/// Info command --json output: structured JSON to stdout.
fn cmd_info_json(firmware: &Path) -> Result<()> {
    let fw = Firmware::from_file(firmware)
        .with_context(|| format!("failed to load firmware {}", firmware.display()))?;

    let metadata: serde_json::Map<String, serde_json::Value> = fw
        .metadata()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let info = serde_json::json!({
        "board_id": fw.board_id()?,
        "board_revision": fw.board_revision()?,
        "image_size": fw.image_size()?,
        "padded_size": fw.image().len(),
        "crc": format!("{:#010x}", fw.crc(fw.image().len())),
        "metadata": metadata,
    });

    println!(
        "{}",
        serde_json::to_string_pretty(&info).unwrap_or_default()
    );
    Ok(())
}
