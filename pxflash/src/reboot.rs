//! Coaxing a running flight stack back into its bootloader.
//!
//! When a port answers nothing to the sync probe, the board is usually
//! running application firmware rather than the bootloader. Two avenues
//! can get it back: the NSH shell (if a console sits on this port) and a
//! MAVLink reboot command (if a telemetry stream does). Neither produces
//! a reply we can wait for, so everything here is fire-and-forget and the
//! caller simply retries synchronization afterwards.

use log::{debug, trace};

use crate::port::Port;

/// Carriage returns that wake the NSH shell.
pub const NSH_INIT: [u8; 3] = [0x0d, 0x0d, 0x0d];

/// NSH command: reboot and stay in the bootloader.
pub const NSH_REBOOT_BL: &[u8] = b"reboot -b\n";

/// NSH command: plain reboot.
pub const NSH_REBOOT: &[u8] = b"reboot\n";

/// MAVLink v1 COMMAND_LONG frame: PREFLIGHT_REBOOT_SHUTDOWN (246) with
/// param1 = 1.0 (reboot into bootloader), addressed to component 1.
/// Fixed payload, precomputed checksum.
pub const MAVLINK_REBOOT_ID1: [u8; 41] = [
    0xfe, 0x21, 0x72, 0xff, 0x00, 0x4c, 0x00, 0x00, 0x80, 0x3f, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xf6, 0x00, 0x01, 0x00, 0x00, 0x48, 0xf0,
];

/// Same frame addressed to component 0.
pub const MAVLINK_REBOOT_ID0: [u8; 41] = [
    0xfe, 0x21, 0x45, 0xff, 0x00, 0x4c, 0x00, 0x00, 0x80, 0x3f, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xf6, 0x00, 0x00, 0x00, 0x00, 0xd7, 0xac,
];

/// Ask whatever is on the port to reboot into the bootloader.
///
/// Sends the shell route first (wake, `reboot -b`, wake, `reboot`), then
/// the MAVLink frames for both component addresses. Write errors are
/// swallowed: a half-dead port gets retried on the next poll anyway.
pub fn send_reboot<P: Port>(port: &mut P) {
    debug!("requesting reboot to bootloader on {}", port.name());

    let sequences: [&[u8]; 6] = [
        &NSH_INIT,
        NSH_REBOOT_BL,
        &NSH_INIT,
        NSH_REBOOT,
        &MAVLINK_REBOOT_ID1,
        &MAVLINK_REBOOT_ID0,
    ];

    for bytes in sequences {
        if let Err(e) = port.write_all(bytes) {
            trace!("reboot injection write failed (ignoring): {e}");
        }
    }
    if let Err(e) = port.flush() {
        trace!("reboot injection flush failed (ignoring): {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    #[test]
    fn sends_shell_then_mavlink_in_order() {
        let mut port = MockPort::new();
        send_reboot(&mut port);

        let mut expected = Vec::new();
        expected.extend_from_slice(&NSH_INIT);
        expected.extend_from_slice(NSH_REBOOT_BL);
        expected.extend_from_slice(&NSH_INIT);
        expected.extend_from_slice(NSH_REBOOT);
        expected.extend_from_slice(&MAVLINK_REBOOT_ID1);
        expected.extend_from_slice(&MAVLINK_REBOOT_ID0);
        assert_eq!(port.written, expected);
    }

    #[test]
    fn mavlink_frames_are_wire_sized() {
        // v1 framing: 6 header bytes + 33 payload + 2 checksum
        assert_eq!(MAVLINK_REBOOT_ID1.len(), 41);
        assert_eq!(MAVLINK_REBOOT_ID0.len(), 41);
        assert_eq!(MAVLINK_REBOOT_ID1[0], 0xfe);
        assert_eq!(MAVLINK_REBOOT_ID0[0], 0xfe);
    }

    #[test]
    fn write_errors_are_swallowed() {
        let mut port = MockPort::new();
        port.fail_writes = true;
        // must not panic or error out
        send_reboot(&mut port);
        assert!(port.written.is_empty());
    }
}
