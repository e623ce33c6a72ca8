//! Scripted in-memory port for protocol tests.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::bootloader::{INSYNC, OK};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

/// One scripted read outcome.
enum Step {
    /// Bytes the "device" sends.
    Reply(Vec<u8>),
    /// One read call that times out.
    TimedOut,
}

/// Mock serial port with a scripted read side and a recording write side.
///
/// Reads pop bytes off the script in order; once the script is exhausted
/// every read times out, which is what a silent device looks like through
/// a real port.
pub(crate) struct MockPort {
    steps: VecDeque<Step>,
    /// Everything the code under test wrote, in order.
    pub written: Vec<u8>,
    /// Whether writes should fail (exercises best-effort senders).
    pub fail_writes: bool,
    timeout: Duration,
    cleared: usize,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            steps: VecDeque::new(),
            written: Vec::new(),
            fail_writes: false,
            timeout: Duration::from_millis(500),
            cleared: 0,
        }
    }

    /// Queue raw reply bytes.
    pub fn reply(mut self, bytes: &[u8]) -> Self {
        self.steps.push_back(Step::Reply(bytes.to_vec()));
        self
    }

    /// Queue one read that times out.
    pub fn time_out(mut self) -> Self {
        self.steps.push_back(Step::TimedOut);
        self
    }

    /// Queue a successful sync handshake (INSYNC + OK).
    pub fn sync_reply(self) -> Self {
        self.reply(&[INSYNC, OK])
    }

    /// Queue a GET_DEVICE-style integer reply followed by the handshake.
    pub fn info_reply(self, value: u32) -> Self {
        let mut bytes = value.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[INSYNC, OK]);
        self.reply(&bytes)
    }

    /// How many times the input buffer was discarded.
    pub fn clears(&self) -> usize {
        self.cleared
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.steps.front_mut() {
            Some(Step::Reply(bytes)) => {
                let n = buf.len().min(bytes.len());
                for (dst, src) in buf.iter_mut().zip(bytes.drain(..n)) {
                    *dst = src;
                }
                if bytes.is_empty() {
                    self.steps.pop_front();
                }
                Ok(n)
            },
            Some(Step::TimedOut) => {
                self.steps.pop_front();
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"))
            },
            None => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data")),
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.fail_writes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write failed",
            ));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_input(&mut self) -> Result<()> {
        self.cleared += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
