//! Upload status reporting.
//!
//! The protocol engine never prints; it announces phase changes and chunk
//! progress through a [`Reporter`] the caller injects, and the CLI decides
//! how to render them.

use crate::error::Error;

/// Phases of an upload, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Erasing the application flash.
    Erase,
    /// Programming image chunks.
    Program,
    /// Verifying flash contents against the image.
    Verify,
    /// Booting the freshly flashed application.
    Reboot,
}

impl Phase {
    /// Short human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Erase => "erase",
            Self::Program => "program",
            Self::Verify => "verify",
            Self::Reboot => "reboot",
        }
    }
}

/// Callback surface an upload session reports through.
///
/// All methods default to no-ops so implementors pick what they render.
pub trait Reporter {
    /// A new phase is starting.
    fn phase(&mut self, phase: Phase) {
        let _ = phase;
    }

    /// Bytes handled so far within the current phase.
    fn progress(&mut self, done: usize, total: usize) {
        let _ = (done, total);
    }

    /// The upload is aborting with `error`.
    fn failure(&mut self, error: &Error) {
        let _ = error;
    }
}

/// Reporter that discards everything.
pub struct NullReporter;

impl Reporter for NullReporter {}
