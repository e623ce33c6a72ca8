//! # pxflash
//!
//! A library for flashing PX4 FMU boards through the serial bootloader.
//!
//! This crate provides the core functionality for talking to the FMU
//! bootloader over a serial port, including:
//!
//! - PX4 firmware descriptor parsing (JSON envelope, zlib + base64 image)
//! - The framed request/response bootloader protocol (revisions 2–4)
//! - The upload state machine: identify, erase, program, verify, reboot
//! - The bootloader's CRC-32 variant for revision-3+ verification
//! - Reboot injection for boards still running application firmware
//!
//! Port enumeration and selection, argument handling, and the retry loop
//! across candidate ports live in the CLI crate; the library only needs
//! an already-open byte stream implementing [`Port`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use pxflash::progress::NullReporter;
//! use pxflash::{Firmware, NativePort, SerialConfig, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Parse the firmware descriptor
//!     let firmware = Firmware::from_file("firmware.px4")?;
//!
//!     // The board must already be sitting in its bootloader
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     let mut uploader = Uploader::new(port)?;
//!     uploader.identify()?;
//!     uploader.upload(&firmware, &mut NullReporter)?;
//!     uploader.close()?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod reboot;
pub mod uploader;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    image::Firmware,
    port::{NativePort, NativePortEnumerator, Port, PortEnumerator, PortInfo, SerialConfig},
    progress::{NullReporter, Phase, Reporter},
    protocol::bootloader::{BL_REV_MAX, BL_REV_MIN, BootloaderLink, Command, Info},
    reboot::send_reboot,
    uploader::{DeviceInfo, Uploader, UploaderConfig},
};
