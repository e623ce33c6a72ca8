//! Flash command: scan ports, find the bootloader, run the upload.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use pxflash::{
    Error, Firmware, NativePort, Phase, Reporter, SerialConfig, Uploader, send_reboot,
};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::{Cli, scan};

/// Pause between open attempts on a busy or half-gone port.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Time for a board to re-enumerate after a reboot request.
const REBOOT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Pause between full sweeps over the candidate ports.
const SWEEP_DELAY: Duration = Duration::from_millis(250);

/// Renders upload phases and chunk progress on stderr.
struct ConsoleReporter {
    pb: ProgressBar,
    quiet: bool,
}

impl ConsoleReporter {
    fn new(quiet: bool) -> Self {
        let pb = if quiet || !console::Term::stderr().is_term() {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(0);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} {msg:8} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb
        };
        Self { pb, quiet }
    }

    fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl Reporter for ConsoleReporter {
    fn phase(&mut self, phase: Phase) {
        self.pb.set_message(phase.label());
        if !self.quiet {
            self.pb
                .suspend(|| eprintln!("{} {}...", style("→").cyan(), phase.label()));
        }
    }

    fn progress(&mut self, done: usize, total: usize) {
        self.pb.set_length(total as u64);
        self.pb.set_position(done as u64);
    }

    fn failure(&mut self, error: &Error) {
        debug!("upload aborted: {error}");
        self.pb.abandon();
    }
}

/// Flash command implementation.
///
/// Repeatedly sweeps the candidate ports: a port that answers `identify`
/// gets the upload; one that stays silent gets the reboot injection and
/// another chance on the next sweep.
pub(crate) fn cmd_flash(cli: &Cli, firmware_path: &Path, wait_secs: u64) -> Result<()> {
    let firmware = Firmware::from_file(firmware_path)
        .with_context(|| format!("failed to load firmware {}", firmware_path.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Loaded firmware for board {},{} - waiting for the bootloader...",
            style("📦").cyan(),
            firmware.board_id()?,
            firmware.board_revision()?,
        );
    }

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    loop {
        for name in scan::candidate_ports(cli.port.as_deref()) {
            let port = match NativePort::open(&SerialConfig::new(&name, cli.baud)) {
                Ok(port) => port,
                Err(e) => {
                    // open failed, rate-limit our attempts
                    debug!("could not open {name}: {e}");
                    thread::sleep(OPEN_RETRY_DELAY);
                    continue;
                },
            };

            let mut uploader = Uploader::new(port)?;
            let identified = uploader.identify().map(|d| *d);
            match identified {
                Ok(device) => {
                    if !cli.quiet {
                        eprintln!(
                            "{} Found board {},{} bootloader rev {} on {}",
                            style("🔌").cyan(),
                            device.board_id,
                            device.board_rev,
                            device.bl_rev,
                            name
                        );
                    }

                    let mut reporter = ConsoleReporter::new(cli.quiet);
                    let result = uploader.upload(&firmware, &mut reporter);
                    reporter.finish();

                    // the port is released exactly once, on every exit path
                    let closed = uploader.close();
                    result.with_context(|| format!("upload failed on {name}"))?;
                    closed?;

                    if !cli.quiet {
                        eprintln!(
                            "{} Firmware upload complete",
                            style("✓").green().bold()
                        );
                    }
                    return Ok(());
                },
                Err(e) => {
                    // probably application firmware, not the bootloader
                    debug!("no bootloader on {name}: {e}");
                    if !cli.quiet {
                        eprintln!(
                            "{} No bootloader on {}, requesting reboot...",
                            style("⏳").yellow(),
                            name
                        );
                    }
                    let mut port = uploader.into_port();
                    send_reboot(&mut port);
                    drop(port);
                    // without this pause the next open races the reboot
                    thread::sleep(REBOOT_SETTLE_DELAY);
                },
            }
        }

        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(SWEEP_DELAY);
    }

    bail!("no FMU bootloader found within {wait_secs} seconds")
}
