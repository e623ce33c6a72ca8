//! Upload session state machine.
//!
//! Drives one firmware upload over one serial link, in the strict order
//! the bootloader expects: identify, erase, program, verify, reboot. A
//! session is single-use; retrying after any failure means a fresh
//! session (and a re-erase, since a failed upload leaves flash contents
//! undefined).

use log::{debug, info};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::image::Firmware;
use crate::port::Port;
use crate::progress::{Phase, Reporter};
use crate::protocol::bootloader::{
    BL_REV_MAX, BL_REV_MIN, BootloaderLink, Command, EOC, Info, PROG_MULTI_MAX, READ_MULTI_MAX,
};

/// Session timing knobs.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Per-read timeout on the link. Short, so poll loops stay live.
    pub read_timeout: Duration,
    /// Wall-clock deadline for the erase poll loop. A full-chip erase on
    /// a large part takes on the order of tens of seconds.
    pub erase_timeout: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(500),
            erase_timeout: Duration::from_secs(20),
        }
    }
}

impl UploaderConfig {
    /// Set the per-read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the erase deadline.
    #[must_use]
    pub fn with_erase_timeout(mut self, timeout: Duration) -> Self {
        self.erase_timeout = timeout;
        self
    }
}

/// What `identify` learned about the connected bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Bootloader protocol revision (2–4).
    pub bl_rev: u32,
    /// Board type identifier.
    pub board_id: u32,
    /// Board hardware revision.
    pub board_rev: u32,
    /// Maximum firmware size in bytes.
    pub flash_size: u32,
}

/// One upload session over one bootloader link.
pub struct Uploader<P: Port> {
    link: BootloaderLink<P>,
    config: UploaderConfig,
    device: Option<DeviceInfo>,
}

impl<P: Port> Uploader<P> {
    /// Create a session over an already-open port with default timing.
    pub fn new(port: P) -> Result<Self> {
        Self::with_config(port, UploaderConfig::default())
    }

    /// Create a session with custom timing.
    pub fn with_config(port: P, config: UploaderConfig) -> Result<Self> {
        let link = BootloaderLink::new(port, config.read_timeout)?;
        Ok(Self {
            link,
            config,
            device: None,
        })
    }

    /// Get back into sync with the bootloader.
    ///
    /// Discards any unread input from an earlier, possibly interrupted
    /// exchange before probing.
    pub fn sync(&mut self) -> Result<()> {
        self.link.drain_input()?;
        self.link.send(&[Command::GetSync as u8, EOC])?;
        self.link.expect_sync()
    }

    fn get_info(&mut self, info: Info) -> Result<u32> {
        self.link
            .send(&[Command::GetDevice as u8, info as u8, EOC])?;
        let value = self.link.recv_u32_le()?;
        self.link.expect_sync()?;
        Ok(value)
    }

    /// Query the bootloader revision and board parameters.
    ///
    /// Must succeed before anything is programmed; rejects bootloader
    /// protocol revisions outside [`BL_REV_MIN`]..=[`BL_REV_MAX`].
    pub fn identify(&mut self) -> Result<&DeviceInfo> {
        self.sync()?;

        // the protocol revision decides which commands are valid, so it
        // comes first
        let bl_rev = self.get_info(Info::BlRev)?;
        if !(BL_REV_MIN..=BL_REV_MAX).contains(&bl_rev) {
            return Err(Error::Compatibility(format!(
                "unsupported bootloader protocol revision {bl_rev}"
            )));
        }

        let board_id = self.get_info(Info::BoardId)?;
        let board_rev = self.get_info(Info::BoardRev)?;
        let flash_size = self.get_info(Info::FlashSize)?;

        info!(
            "bootloader rev {bl_rev}, board {board_id} rev {board_rev}, {flash_size} bytes flash"
        );
        Ok(self.device.insert(DeviceInfo {
            bl_rev,
            board_id,
            board_rev,
            flash_size,
        }))
    }

    /// Device parameters from a successful `identify`, if any.
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    fn require_device(&self) -> Result<DeviceInfo> {
        self.device
            .ok_or_else(|| Error::Protocol("device has not been identified".into()))
    }

    /// Erase the application flash.
    ///
    /// The bootloader goes quiet while erasing and only answers the sync
    /// handshake once it is done, so this polls `expect_sync`, absorbing
    /// per-read timeouts, until the configured deadline.
    pub fn erase(&mut self) -> Result<()> {
        debug!("erasing chip");
        self.link.send(&[Command::ChipErase as u8, EOC])?;

        let deadline = Instant::now() + self.config.erase_timeout;
        while Instant::now() < deadline {
            match self.link.expect_sync() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::EraseTimeout)
    }

    /// Program the firmware image in `PROG_MULTI`-sized chunks.
    ///
    /// Aborts on the first chunk the bootloader does not acknowledge.
    pub fn program(&mut self, firmware: &Firmware, reporter: &mut dyn Reporter) -> Result<()> {
        self.require_device()?;
        let image = firmware.image();
        debug!("programming {} bytes", image.len());

        let mut done = 0;
        for chunk in image.chunks(PROG_MULTI_MAX) {
            self.program_multi(chunk)?;
            done += chunk.len();
            reporter.progress(done, image.len());
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)] // chunks are at most 60 bytes
    fn program_multi(&mut self, chunk: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(chunk.len() + 3);
        frame.push(Command::ProgMulti as u8);
        frame.push(chunk.len() as u8);
        frame.extend_from_slice(chunk);
        frame.push(EOC);
        self.link.send(&frame)?;
        self.link.expect_sync()
    }

    /// Verify flash contents against the image.
    ///
    /// Revision 2 bootloaders only support reading flash back; revision 3
    /// and later replaced that with a device-side CRC. The dispatch is on
    /// the revision reported by `identify`.
    pub fn verify(&mut self, firmware: &Firmware, reporter: &mut dyn Reporter) -> Result<()> {
        let device = self.require_device()?;
        if device.bl_rev == 2 {
            self.verify_readback(firmware, reporter)
        } else {
            self.verify_crc(firmware, device.flash_size)
        }
    }

    #[allow(clippy::cast_possible_truncation)] // chunks are at most 60 bytes
    fn verify_readback(&mut self, firmware: &Firmware, reporter: &mut dyn Reporter) -> Result<()> {
        debug!("verifying by read-back");
        self.link.send(&[Command::ChipVerify as u8, EOC])?;
        self.link.expect_sync()?;

        let image = firmware.image();
        let mut offset = 0;
        for chunk in image.chunks(READ_MULTI_MAX) {
            self.link
                .send(&[Command::ReadMulti as u8, chunk.len() as u8, EOC])?;
            self.link.flush()?;
            let programmed = self.link.recv(chunk.len())?;
            if programmed != chunk {
                return Err(Error::VerifyMismatch {
                    offset,
                    expected: chunk.to_vec(),
                    actual: programmed,
                });
            }
            self.link.expect_sync()?;
            offset += chunk.len();
            reporter.progress(offset, image.len());
        }
        Ok(())
    }

    fn verify_crc(&mut self, firmware: &Firmware, flash_size: u32) -> Result<()> {
        let expected = firmware.crc(flash_size as usize);
        debug!("verifying by CRC, expecting {expected:#010x}");

        self.link.send(&[Command::GetCrc as u8, EOC])?;
        let reported = self.link.recv_u32_le()?;
        self.link.expect_sync()?;

        if reported != expected {
            return Err(Error::CrcMismatch {
                expected,
                actual: reported,
            });
        }
        Ok(())
    }

    /// Boot the application.
    pub fn reboot(&mut self) -> Result<()> {
        let device = self.require_device()?;
        debug!("rebooting");
        self.link.send(&[Command::Reboot as u8, EOC])?;
        self.link.flush()?;

        // rev 3+ reports a failure here if writing the first word failed;
        // rev 2 devices may already be gone
        if device.bl_rev >= 3 {
            self.link.expect_sync()?;
        }
        Ok(())
    }

    /// Run the full upload: compatibility checks, then
    /// erase → program → verify → reboot.
    ///
    /// The firmware is checked against the identified board before any
    /// device write. On failure the reporter sees the terminal error and
    /// the error propagates; flash contents are undefined at that point.
    pub fn upload(&mut self, firmware: &Firmware, reporter: &mut dyn Reporter) -> Result<()> {
        let result = self.run_upload(firmware, reporter);
        if let Err(ref e) = result {
            reporter.failure(e);
        }
        result
    }

    fn run_upload(&mut self, firmware: &Firmware, reporter: &mut dyn Reporter) -> Result<()> {
        let device = self.require_device()?;

        let board_id = firmware.board_id()?;
        if device.board_id != board_id {
            return Err(Error::Compatibility(format!(
                "firmware is for board {board_id}, device reports board {}",
                device.board_id
            )));
        }
        let image_size = firmware.image_size()?;
        if device.flash_size < image_size {
            return Err(Error::Compatibility(format!(
                "image is {image_size} bytes, device has {} bytes of flash",
                device.flash_size
            )));
        }

        reporter.phase(Phase::Erase);
        self.erase()?;

        reporter.phase(Phase::Program);
        self.program(firmware, reporter)?;

        reporter.phase(Phase::Verify);
        self.verify(firmware, reporter)?;

        reporter.phase(Phase::Reboot);
        self.reboot()?;

        info!("upload complete");
        Ok(())
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.link.name()
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.link.close()
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.link.into_port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::progress::NullReporter;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write as _;

    /// Build a loadable firmware around a raw image, targeting board 9.
    fn firmware(image: &[u8]) -> Firmware {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(image).unwrap();
        let compressed = encoder.finish().unwrap();
        let desc = serde_json::json!({
            "board_id": 9,
            "board_revision": 0,
            "image_size": image.len(),
            "image": BASE64.encode(&compressed),
        });
        Firmware::from_json(&serde_json::to_vec(&desc).unwrap()).unwrap()
    }

    /// Script the replies `identify` consumes.
    fn identify_script(port: MockPort, bl_rev: u32, board_id: u32, flash_size: u32) -> MockPort {
        port.sync_reply()
            .info_reply(bl_rev)
            .info_reply(board_id)
            .info_reply(1) // board_rev
            .info_reply(flash_size)
    }

    fn uploader(port: MockPort) -> Uploader<MockPort> {
        Uploader::new(port).unwrap()
    }

    /// Reporter that records every callback.
    #[derive(Default)]
    struct RecordingReporter {
        phases: Vec<Phase>,
        progress: Vec<(usize, usize)>,
        failures: usize,
    }

    impl Reporter for RecordingReporter {
        fn phase(&mut self, phase: Phase) {
            self.phases.push(phase);
        }
        fn progress(&mut self, done: usize, total: usize) {
            self.progress.push((done, total));
        }
        fn failure(&mut self, _error: &Error) {
            self.failures += 1;
        }
    }

    #[test]
    fn identify_stores_device_parameters() {
        let port = identify_script(MockPort::new(), 3, 9, 16384);
        let mut up = uploader(port);
        let device = *up.identify().unwrap();

        assert_eq!(device.bl_rev, 3);
        assert_eq!(device.board_id, 9);
        assert_eq!(device.board_rev, 1);
        assert_eq!(device.flash_size, 16384);
        assert_eq!(up.device(), Some(&device));

        let port = up.into_port();
        // stale input discarded once, before the sync probe
        assert_eq!(port.clears(), 1);
        // GET_SYNC then the four GET_DEVICE queries, in order
        assert_eq!(
            port.written,
            vec![
                0x21, 0x20, // GET_SYNC
                0x22, 0x01, 0x20, // bootloader revision
                0x22, 0x02, 0x20, // board id
                0x22, 0x03, 0x20, // board revision
                0x22, 0x04, 0x20, // flash size
            ]
        );
    }

    #[test]
    fn identify_accepts_supported_revisions() {
        for rev in [2, 3, 4] {
            let port = identify_script(MockPort::new(), rev, 9, 16384);
            let mut up = uploader(port);
            assert_eq!(up.identify().unwrap().bl_rev, rev);
        }
    }

    #[test]
    fn identify_rejects_unsupported_revisions() {
        for rev in [0, 1, 5, 99] {
            let port = MockPort::new().sync_reply().info_reply(rev);
            let mut up = uploader(port);
            assert!(matches!(up.identify(), Err(Error::Compatibility(_))));
            assert!(up.device().is_none());
        }
    }

    #[test]
    fn operations_require_identify_first() {
        let fw = firmware(&[0u8; 8]);
        let mut up = uploader(MockPort::new());
        assert!(matches!(
            up.program(&fw, &mut NullReporter),
            Err(Error::Protocol(_))
        ));
        let mut up = uploader(MockPort::new());
        assert!(matches!(
            up.verify(&fw, &mut NullReporter),
            Err(Error::Protocol(_))
        ));
        let mut up = uploader(MockPort::new());
        assert!(matches!(up.reboot(), Err(Error::Protocol(_))));
    }

    #[test]
    fn upload_rejects_wrong_board_before_touching_flash() {
        // device reports board 5, firmware targets board 9
        let port = identify_script(MockPort::new(), 3, 5, 16384);
        let mut up = uploader(port);
        up.identify().unwrap();

        let mut reporter = RecordingReporter::default();
        let err = up.upload(&firmware(&[0u8; 8]), &mut reporter).unwrap_err();
        assert!(matches!(err, Error::Compatibility(_)));
        assert_eq!(reporter.failures, 1);
        assert!(reporter.phases.is_empty());

        // CHIP_ERASE must never have gone out
        assert!(!up.into_port().written.contains(&(Command::ChipErase as u8)));
    }

    #[test]
    fn upload_rejects_oversized_image_before_touching_flash() {
        let port = identify_script(MockPort::new(), 3, 9, 4);
        let mut up = uploader(port);
        up.identify().unwrap();

        let err = up
            .upload(&firmware(&[0u8; 64]), &mut NullReporter)
            .unwrap_err();
        assert!(matches!(err, Error::Compatibility(_)));
        assert!(!up.into_port().written.contains(&(Command::ChipErase as u8)));
    }

    #[test]
    fn erase_retries_through_timeouts() {
        // three silent polls while the erase runs, then the sync arrives
        let port = MockPort::new().time_out().time_out().time_out().sync_reply();
        let mut up = uploader(port);
        assert!(up.erase().is_ok());
        assert_eq!(up.into_port().written, vec![0x23, 0x20]);
    }

    #[test]
    fn erase_gives_up_at_the_deadline() {
        let config = UploaderConfig::default().with_erase_timeout(Duration::from_millis(20));
        let mut up = Uploader::with_config(MockPort::new(), config).unwrap();
        assert!(matches!(up.erase(), Err(Error::EraseTimeout)));
    }

    #[test]
    fn erase_propagates_non_timeout_errors() {
        use crate::protocol::bootloader::{FAILED, INSYNC};
        let port = MockPort::new().time_out().reply(&[INSYNC, FAILED]);
        let mut up = uploader(port);
        assert!(matches!(up.erase(), Err(Error::OperationFailed)));
    }

    #[test]
    fn program_splits_into_sixty_byte_frames() {
        let image: Vec<u8> = (0u8..130).collect(); // pads to 132
        let fw = firmware(&image);

        let mut port = identify_script(MockPort::new(), 3, 9, 16384);
        for _ in 0..3 {
            port = port.sync_reply();
        }
        let mut up = uploader(port);
        up.identify().unwrap();

        let mut reporter = RecordingReporter::default();
        up.program(&fw, &mut reporter).unwrap();
        assert_eq!(reporter.progress, vec![(60, 132), (120, 132), (132, 132)]);

        let written = up.into_port().written;
        let mut frames = &written[14..]; // skip the identify exchange
        for expected_len in [60usize, 60, 12] {
            assert_eq!(frames[0], Command::ProgMulti as u8);
            assert_eq!(frames[1] as usize, expected_len);
            assert_eq!(frames[2 + expected_len], EOC);
            frames = &frames[3 + expected_len..];
        }
        assert!(frames.is_empty());
    }

    #[test]
    fn program_stops_on_first_unacknowledged_chunk() {
        use crate::protocol::bootloader::{FAILED, INSYNC};
        let image: Vec<u8> = (0u8..120).collect();
        let fw = firmware(&image);

        let port = identify_script(MockPort::new(), 3, 9, 16384)
            .sync_reply()
            .reply(&[INSYNC, FAILED]);
        let mut up = uploader(port);
        up.identify().unwrap();

        let mut reporter = RecordingReporter::default();
        let err = up.program(&fw, &mut reporter).unwrap_err();
        assert!(matches!(err, Error::OperationFailed));
        // only the first chunk was reported before the abort
        assert_eq!(reporter.progress, vec![(60, 120)]);
    }

    #[test]
    fn upload_runs_the_full_protocol_on_rev3() {
        let image = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let fw = firmware(&image);
        let crc = fw.crc(16384);

        let port = identify_script(MockPort::new(), 3, 9, 16384)
            .sync_reply() // erase
            .sync_reply() // one PROG_MULTI chunk
            .info_reply(crc) // GET_CRC value + handshake
            .sync_reply(); // reboot (rev 3 answers)
        let mut up = uploader(port);
        up.identify().unwrap();

        let mut reporter = RecordingReporter::default();
        up.upload(&fw, &mut reporter).unwrap();

        assert_eq!(
            reporter.phases,
            vec![Phase::Erase, Phase::Program, Phase::Verify, Phase::Reboot]
        );
        assert_eq!(reporter.failures, 0);

        let written = up.into_port().written;
        // the tail of the exchange is GET_CRC then REBOOT
        let tail = &written[written.len() - 4..];
        assert_eq!(tail, &[Command::GetCrc as u8, EOC, Command::Reboot as u8, EOC]);
    }

    #[test]
    fn crc_mismatch_carries_both_values() {
        let image = [0xaau8; 8];
        let fw = firmware(&image);
        let crc = fw.crc(16384);

        let port = identify_script(MockPort::new(), 4, 9, 16384).info_reply(crc ^ 1);
        let mut up = uploader(port);
        up.identify().unwrap();

        match up.verify(&fw, &mut NullReporter) {
            Err(Error::CrcMismatch { expected, actual }) => {
                assert_eq!(expected, crc);
                assert_eq!(actual, crc ^ 1);
            },
            other => panic!("expected CrcMismatch, got {other:?}"),
        }
    }

    #[test]
    fn rev2_verify_reads_flash_back() {
        let image = [0x10u8, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80];
        let fw = firmware(&image);

        let port = identify_script(MockPort::new(), 2, 9, 16384)
            .sync_reply() // CHIP_VERIFY
            .reply(&image) // read-back matches
            .sync_reply();
        let mut up = uploader(port);
        up.identify().unwrap();
        up.verify(&fw, &mut NullReporter).unwrap();

        let written = up.into_port().written;
        let tail = &written[written.len() - 5..];
        assert_eq!(
            tail,
            &[
                Command::ChipVerify as u8,
                EOC,
                Command::ReadMulti as u8,
                8,
                EOC
            ]
        );
    }

    #[test]
    fn rev2_verify_mismatch_carries_both_buffers() {
        let image = [0x10u8, 0x20, 0x30, 0x40];
        let fw = firmware(&image);
        let garbled = [0x10u8, 0x20, 0xff, 0x40];

        let port = identify_script(MockPort::new(), 2, 9, 16384)
            .sync_reply()
            .reply(&garbled);
        let mut up = uploader(port);
        up.identify().unwrap();

        match up.verify(&fw, &mut NullReporter) {
            Err(Error::VerifyMismatch {
                offset,
                expected,
                actual,
            }) => {
                assert_eq!(offset, 0);
                assert_eq!(expected, image.to_vec());
                assert_eq!(actual, garbled.to_vec());
            },
            other => panic!("expected VerifyMismatch, got {other:?}"),
        }
    }

    #[test]
    fn reboot_on_rev2_does_not_wait_for_a_reply() {
        let port = identify_script(MockPort::new(), 2, 9, 16384);
        let mut up = uploader(port);
        up.identify().unwrap();
        // no scripted reply: rev 2 must not read after REBOOT
        up.reboot().unwrap();

        let written = up.into_port().written;
        assert_eq!(&written[written.len() - 2..], &[Command::Reboot as u8, EOC]);
    }

    #[test]
    fn reboot_on_rev3_requires_the_handshake() {
        let port = identify_script(MockPort::new(), 3, 9, 16384).sync_reply();
        let mut up = uploader(port);
        up.identify().unwrap();
        up.reboot().unwrap();

        // and with a silent device the same call times out
        let port = identify_script(MockPort::new(), 3, 9, 16384);
        let mut up = uploader(port);
        up.identify().unwrap();
        assert!(matches!(up.reboot(), Err(Error::Timeout(_))));
    }
}
