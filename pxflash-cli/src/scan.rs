//! Candidate port selection for the bootloader scan loop.
//!
//! The library deliberately does not know how to find the board; this
//! module decides which ports are worth probing. The user can pin one or
//! more ports (comma-separated), otherwise every enumerated port that
//! looks plausible for the host platform is tried.

use log::debug;
use pxflash::{NativePortEnumerator, PortEnumerator};

/// Ports to probe for a bootloader, in order.
///
/// With `patterns` set, each comma-separated entry is taken as a port
/// path to try verbatim. Without it, enumerated ports are filtered
/// through [`plausible_on_this_platform`].
pub fn candidate_ports(patterns: Option<&str>) -> Vec<String> {
    if let Some(patterns) = patterns {
        return patterns
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }

    let ports: Vec<String> = NativePortEnumerator::list_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.name)
        .filter(|name| plausible_on_this_platform(name))
        .collect();
    debug!("candidate ports: {ports:?}");
    ports
}

/// Whether a port name makes sense to open on this host.
///
/// Mixed-platform port lists show up when users share configs between
/// machines; opening the wrong kind wedges some USB-serial drivers, so
/// Windows-style names are skipped on unix and vice versa.
pub fn plausible_on_this_platform(name: &str) -> bool {
    if cfg!(windows) {
        !name.contains('/')
    } else {
        !name.contains("COM")
    }
}
