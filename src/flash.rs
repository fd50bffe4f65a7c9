//! Flash driver: the top-level orchestrator that puts the chip into
//! bootloader mode, walks the handshake state machine per frame, and
//! verifies the final firmware version.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{FlashError, Result};
use crate::image::ImageReader;
use crate::state_machine::{
    self, BootloaderIdentity, HandshakeOutcome, FRAME_CRC_PASS, WAITING_BOOTLOAD_CMD,
    WAITING_FRAME_DATA,
};
use crate::transport::{Transport, TransportKind};

/// Fixed unlock sequence written once the chip confirms `WAITING_BOOTLOAD_CMD`.
const UNLOCK_CMD: [u8; 2] = [0xDC, 0xAA];

/// Nominal wait for the chip to boot its application firmware after the
/// final frame, and after issuing reset-into-bootloader.
#[cfg(not(test))]
const RESET_WAIT: Duration = Duration::from_secs(2);
#[cfg(test)]
const RESET_WAIT: Duration = Duration::from_millis(1);

/// How often an informational progress line is emitted during the frame loop.
const PROGRESS_INTERVAL: u32 = 20;

/// Outcome of a flash request that completed without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    /// Flashed and verified; carries the observed post-flash firmware version.
    Success { version: String },
    /// All frames were sent, but no application-mode address was known (the
    /// caller supplied an address outside the bootloader-address lookup
    /// table, so it was used directly and there is nothing to rescan or
    /// verify against).
    SentNoVerify,
    /// The version gate fired before any frame was transmitted: the chip
    /// already reports the expected version, so flashing was skipped.
    AlreadyAtVersion { version: String },
}

/// Owns the image reader and transport handle for one flash attempt.
/// Created on flash request, destroyed after success or first fatal error.
pub struct FlashSession<T: Transport> {
    transport: T,
    bus: u8,
    /// Caller-supplied application-mode slave address, if any. `None` means
    /// "discover via scan".
    slave_addr: Option<u8>,
    appmode_addr: Option<u8>,
    bootloader_addr: u8,
    appmode_version: Option<String>,
    expected_version: Option<String>,
    /// False only when the supplied address was used directly as a
    /// bootloader address, with no known application-mode counterpart.
    verify_after_flash: bool,
}

impl<T: Transport> FlashSession<T> {
    pub fn new(
        transport: T,
        bus: u8,
        slave_addr: Option<u8>,
        expected_version: Option<String>,
    ) -> Self {
        FlashSession {
            transport,
            bus,
            slave_addr,
            appmode_addr: None,
            bootloader_addr: slave_addr.unwrap_or(0),
            appmode_version: None,
            expected_version,
            verify_after_flash: true,
        }
    }

    /// Top-level entry point: flashes `image_path` into the chip.
    pub fn flash(&mut self, image_path: &Path) -> Result<FlashOutcome> {
        let file = File::open(image_path).map_err(|source| FlashError::ImageOpenFailed {
            path: image_path.display().to_string(),
            source,
        })?;
        let mut reader = ImageReader::new(BufReader::new(file));

        if let Some(outcome) = self.enter_bootloader()? {
            return Ok(outcome);
        }

        let mut identity = BootloaderIdentity::default();
        match state_machine::check_bootloader(&mut self.transport, &mut identity, WAITING_BOOTLOAD_CMD) {
            Ok(HandshakeOutcome::Ok) => {
                info!("unlocking bootloader");
                self.transport.write(&UNLOCK_CMD)?;
            }
            Ok(HandshakeOutcome::AlreadyUnlocked) => {
                info!("bootloader found, already unlocked");
            }
            Err(_) => return Err(FlashError::BootloaderNotFound),
        }

        self.send_frames(&mut reader, &mut identity)?;

        if !self.verify_after_flash {
            info!("sent all firmware frames");
            return Ok(FlashOutcome::SentNoVerify);
        }

        info!("sent all firmware frames, waiting for reset");
        thread::sleep(RESET_WAIT);

        let version = self.rescan_and_verify()?;
        Ok(FlashOutcome::Success { version })
    }

    fn send_frames(
        &mut self,
        reader: &mut ImageReader<BufReader<File>>,
        identity: &mut BootloaderIdentity,
    ) -> Result<()> {
        let mut frame_no: u32 = 1;

        loop {
            let Some(frame) = reader.next_frame()? else {
                break;
            };

            let mut retried = false;
            loop {
                state_machine::check_bootloader(
                    &mut self.transport,
                    identity,
                    WAITING_FRAME_DATA,
                )?;

                self.transport.write(&frame.bytes)?;

                match state_machine::check_bootloader(&mut self.transport, identity, FRAME_CRC_PASS)
                {
                    Ok(HandshakeOutcome::Ok) => break,
                    Ok(HandshakeOutcome::AlreadyUnlocked) => unreachable!(
                        "AlreadyUnlocked only arises while expecting WAITING_BOOTLOAD_CMD"
                    ),
                    Err(e) if state_machine::is_frame_crc_fail(&e) && !retried => {
                        warn!("frame {}: CRC fail, retrying", frame_no);
                        retried = true;
                        continue;
                    }
                    Err(e) if state_machine::is_frame_crc_fail(&e) => {
                        return Err(FlashError::FrameCrcFail {
                            frame_no,
                            retries: 1,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            if frame_no % PROGRESS_INTERVAL == 0 {
                info!("frame {}: sent {} bytes", frame_no, frame.size());
            } else {
                log::trace!("frame {}: sent {} bytes", frame_no, frame.size());
            }
            frame_no += 1;
        }

        Ok(())
    }

    /// Puts the chip into bootloader mode and computes the bootloader-mode
    /// address. Returns `Some(AlreadyAtVersion)` if the version gate fires
    /// before any reset is issued.
    fn enter_bootloader(&mut self) -> Result<Option<FlashOutcome>> {
        match self.slave_addr {
            Some(addr) if !is_recognized_appmode_addr(addr) => {
                info!(
                    "address 0x{:02X} not a known app-mode address, trying bootloader directly",
                    addr
                );
                self.bootloader_addr = addr;
                self.appmode_addr = None;
                self.verify_after_flash = false;
                return Ok(None);
            }
            Some(addr) => {
                self.appmode_addr = Some(addr);
                self.transport.set_slave(self.bus, addr);
            }
            None => {
                let found = self.transport.scan()?;
                if found < 1 {
                    return Err(FlashError::BootloaderNotFound);
                }
                self.appmode_addr = Some(self.transport.address());
            }
        }

        let info = self.transport.get_info()?;
        self.appmode_version = Some(info.firmware_version.clone());
        info!("current firmware version: {}", info.firmware_version);

        if let Some(expected) = &self.expected_version {
            if !expected.is_empty() && *expected == info.firmware_version {
                return Ok(Some(FlashOutcome::AlreadyAtVersion {
                    version: info.firmware_version,
                }));
            }
        }

        self.transport.reset(true)?;
        thread::sleep(RESET_WAIT);

        if let Some(addr) = self.appmode_addr {
            self.bootloader_addr = lookup_bootloader_addr(addr, info.family_id).unwrap_or(addr);
            self.transport.set_slave(self.bus, self.bootloader_addr);
        }

        Ok(None)
    }

    /// Application-mode firmware version recorded before the reset into
    /// bootloader mode, if the chip was entered via a scan rather than a
    /// pre-supplied bootloader address.
    pub fn appmode_version(&self) -> Option<&str> {
        self.appmode_version.as_deref()
    }

    fn rescan_and_verify(&mut self) -> Result<String> {
        match self.transport.kind() {
            TransportKind::I2c | TransportKind::SysfsI2c => {
                if let Some(appmode_addr) = self.appmode_addr {
                    self.transport.set_slave(self.bus, appmode_addr);
                }
            }
            TransportKind::Usb => {
                let found = self.transport.scan()?;
                if found < 1 {
                    return Err(FlashError::PostResetScanFailed);
                }
            }
        }

        let info = self
            .transport
            .get_info()
            .map_err(|_| FlashError::PostResetScanFailed)?;

        if let Some(expected) = &self.expected_version {
            if !expected.is_empty() && *expected != info.firmware_version {
                return Err(FlashError::VerifyMismatch {
                    observed: info.firmware_version,
                    expected: expected.clone(),
                });
            }
        }

        Ok(info.firmware_version)
    }
}

/// Whether `addr` appears in the bootloader-address lookup table at all,
/// independent of `family_id`. An address outside this table is treated as
/// already being a bootloader address rather than an application-mode one.
fn is_recognized_appmode_addr(addr: u8) -> bool {
    matches!(addr, 0x4A | 0x4B | 0x4C | 0x4D | 0x5A | 0x5B)
}

/// Bootloader-mode address lookup table. Returns `None` when the supplied
/// address should be treated as already being a bootloader address.
fn lookup_bootloader_addr(addr: u8, family_id: u8) -> Option<u8> {
    match addr {
        0x4A | 0x4B => {
            if family_id >= 0xA2 {
                Some(addr - 0x24)
            } else {
                Some(addr - 0x26)
            }
        }
        0x4C | 0x4D | 0x5A | 0x5B => Some(addr - 0x26),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{APP_CRC_FAIL, FRAME_CRC_CHECK, FRAME_CRC_FAIL};
    use crate::transport::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_with_preloaded_scan(
        family_id: u8,
        version: &str,
        bus: u8,
        addr: u8,
        expected: Option<&str>,
    ) -> FlashSession<MockTransport> {
        let mut t = MockTransport::new();
        t.info.family_id = family_id;
        t.info.firmware_version = version.to_string();
        FlashSession::new(t, bus, Some(addr), expected.map(|s| s.to_string()))
    }

    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mxt-flasher-test-{}-{}",
            std::process::id(),
            TEST_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_image_file(dir: &std::path::Path, data: &str) -> std::path::PathBuf {
        let path = dir.join("fw.hex");
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn lookup_bootloader_addr_family_gate() {
        assert_eq!(lookup_bootloader_addr(0x4A, 0xA2), Some(0x26));
        assert_eq!(lookup_bootloader_addr(0x4A, 0x90), Some(0x24));
        assert_eq!(lookup_bootloader_addr(0x4C, 0x00), Some(0x26));
        assert_eq!(lookup_bootloader_addr(0x10, 0x00), None);
        assert!(!is_recognized_appmode_addr(0x10));
        assert!(is_recognized_appmode_addr(0x5B));
    }

    #[test]
    fn happy_path_two_frames() {
        let dir = tempdir();
        let path = write_image_file(&dir, "0006AABBCCDDEEFF11220004DEADBEEF3344");

        let mut session = session_with_preloaded_scan(0xA2, "1.1.AA", 0, 0x4A, None);

        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_PASS]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_PASS]);

        let result = session.flash(&path).expect("flash should succeed");
        match result {
            FlashOutcome::Success { version } => assert_eq!(version, "1.1.AA"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(session.transport.writes.len(), 3); // unlock + 2 frames
        assert_eq!(session.transport.writes[0], UNLOCK_CMD);
        assert_eq!(session.appmode_version(), Some("1.1.AA"));
    }

    #[test]
    fn already_unlocked_skips_unlock_write() {
        let dir = tempdir();
        let path = write_image_file(&dir, "");

        let mut session = session_with_preloaded_scan(0xA2, "1.0.AA", 0, 0x4A, None);
        session.transport.push_read(&[WAITING_FRAME_DATA]);

        let result = session.flash(&path).unwrap();
        assert!(matches!(result, FlashOutcome::Success { .. }));
        assert!(session.transport.writes.is_empty());
    }

    #[test]
    fn one_retry_then_pass() {
        let dir = tempdir();
        let path = write_image_file(&dir, "0002AABB11220002CCDD3344");

        let mut session = session_with_preloaded_scan(0xA2, "1.0.AA", 0, 0x4A, None);
        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_FAIL]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_PASS]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_PASS]);

        let result = session.flash(&path).unwrap();
        assert!(matches!(result, FlashOutcome::Success { .. }));
        assert_eq!(session.transport.writes.len(), 4);
        assert_eq!(session.transport.writes[1], session.transport.writes[2]);
    }

    #[test]
    fn two_failures_is_fatal() {
        let dir = tempdir();
        let path = write_image_file(&dir, "0002AABB1122");

        let mut session = session_with_preloaded_scan(0xA2, "1.0.AA", 0, 0x4A, None);
        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_FAIL]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_FAIL]);

        let err = session.flash(&path).unwrap_err();
        assert!(matches!(
            err,
            FlashError::FrameCrcFail {
                frame_no: 1,
                retries: 1
            }
        ));
    }

    #[test]
    fn version_gate_fires_before_reset() {
        let dir = tempdir();
        let path = write_image_file(&dir, "0002AABB1122");

        let mut session = session_with_preloaded_scan(0xA2, "1.0.AA", 0, 0x4A, Some("1.0.AA"));

        let result = session.flash(&path).unwrap();
        assert_eq!(
            result,
            FlashOutcome::AlreadyAtVersion {
                version: "1.0.AA".to_string()
            }
        );
        assert!(session.transport.writes.is_empty());
    }

    #[test]
    fn zero_frame_image_succeeds() {
        let dir = tempdir();
        let path = write_image_file(&dir, "");

        let mut session = session_with_preloaded_scan(0xA2, "1.0.AA", 0, 0x4A, None);
        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);

        let result = session.flash(&path).unwrap();
        assert!(matches!(result, FlashOutcome::Success { .. }));
        assert_eq!(session.transport.writes.len(), 1); // only the unlock
    }

    #[test]
    fn app_crc_fail_transient_during_unlock_handshake() {
        let dir = tempdir();
        let path = write_image_file(&dir, "");

        let mut session = session_with_preloaded_scan(0xA2, "1.0.AA", 0, 0x4A, None);
        session.transport.push_read(&[APP_CRC_FAIL]);
        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);

        let result = session.flash(&path).unwrap();
        assert!(matches!(result, FlashOutcome::Success { .. }));
    }

    #[test]
    fn frame_crc_check_transient_before_pass() {
        let dir = tempdir();
        let path = write_image_file(&dir, "0002AABB1122");

        let mut session = session_with_preloaded_scan(0xA2, "1.0.AA", 0, 0x4A, None);
        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);
        session.transport.push_read(&[WAITING_FRAME_DATA]);
        session.transport.push_read(&[FRAME_CRC_CHECK]);
        session.transport.push_read(&[FRAME_CRC_PASS]);

        let result = session.flash(&path).unwrap();
        assert!(matches!(result, FlashOutcome::Success { .. }));
    }

    #[test]
    fn unrecognized_address_used_directly_skips_verify() {
        let dir = tempdir();
        let path = write_image_file(&dir, "");

        // 0x10 is not in the app-mode address lookup table.
        let mut t = MockTransport::new();
        let mut session = {
            t.info.family_id = 0xA2;
            FlashSession::new(t, 0, Some(0x10), None)
        };
        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);

        let result = session.flash(&path).unwrap();
        assert_eq!(result, FlashOutcome::SentNoVerify);
        assert_eq!(session.bootloader_addr, 0x10);
    }

    #[test]
    fn no_address_supplied_discovers_via_scan() {
        let dir = tempdir();
        let path = write_image_file(&dir, "");

        let mut t = MockTransport::new();
        t.info.firmware_version = "2.0.BB".to_string();
        let mut session = FlashSession::new(t, 0, None, None);
        session.transport.push_read(&[WAITING_BOOTLOAD_CMD]);

        let result = session.flash(&path).unwrap();
        assert!(matches!(result, FlashOutcome::Success { version } if version == "2.0.BB"));
    }
}
