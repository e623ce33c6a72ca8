//! pxflash CLI - serial firmware uploader for the PX4 FMU bootloader.
//!
//! ## Features
//!
//! - Upload `.px4` firmware files through the serial bootloader
//! - Automatic port scanning with reboot injection for boards still
//!   running application firmware
//! - Firmware descriptor inspection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use log::debug;
use pxflash::{NativePortEnumerator, PortEnumerator};
use std::env;
use std::io;
use std::path::PathBuf;

mod commands;
mod scan;

/// pxflash - firmware uploader for PX4 FMU flight controllers.
///
/// Environment variables:
///   PXFLASH_PORT   - Serial port(s) to try, comma-separated
///   PXFLASH_BAUD   - Baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "pxflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port(s) the board may be attached to, comma-separated
    /// (all plausible ports are scanned if not specified).
    #[arg(short, long, global = true, env = "PXFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the serial port.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "PXFLASH_BAUD"
    )]
    baud: u32,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload a firmware file through the bootloader.
    Flash {
        /// Path to the .px4 firmware file.
        firmware: PathBuf,

        /// How long to keep scanning for a bootloader, in seconds.
        #[arg(long, default_value = "60")]
        wait_secs: u64,
    },

    /// Show information about a firmware file.
    Info {
        /// Path to the .px4 firmware file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "pxflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match &cli.command {
        Commands::Flash {
            firmware,
            wait_secs,
        } => {
            commands::flash::cmd_flash(&cli, firmware, *wait_secs)?;
        },
        Commands::Info { firmware, json } => {
            commands::info::cmd_info(firmware, *json)?;
        },
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
        },
        Commands::Completions { shell } => {
            cmd_completions(*shell);
        },
    }

    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let ports = NativePortEnumerator::list_ports().unwrap_or_default();

    if json {
        let ports: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("no serial ports found").dim());
        return;
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            product
        );
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
