//! Transport capability set consumed by the protocol driver.
//!
//! The driver only ever sees this abstract capability set; concrete channels
//! (I²C, USB, sysfs) are external collaborators. Only the I²C flavor is
//! implemented concretely here — USB/sysfs transports exist in this module
//! only as `TransportKind` variants so the post-reset re-scan logic can
//! branch on them.

use crate::error::Result;

/// Which concrete channel a `Transport` is backed by. Used only by the
/// post-reset re-scan/re-discovery logic in the flash driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    I2c,
    Usb,
    SysfsI2c,
}

/// Chip info block: family/variant identification and current firmware version.
#[derive(Debug, Clone)]
pub struct InfoBlock {
    pub family_id: u8,
    pub firmware_version: String,
}

/// Opaque byte channel to the chip.
pub trait Transport {
    /// Read exactly `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write exactly `buf.len()` bytes.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Switch I²C slave address. No-op for USB.
    fn set_slave(&mut self, bus: u8, addr: u8);

    /// Per-interrupt wait; for USB, polls the CHG line. Returns `false` if
    /// the device is still busy when the wait gives up (a recoverable
    /// timeout; the caller proceeds with the next read attempt regardless).
    fn wait_ready(&mut self) -> bool;

    /// Discover connected device(s); returns a count.
    fn scan(&mut self) -> Result<u32>;

    fn kind(&self) -> TransportKind;

    /// The slave address this transport is currently bound to (after a
    /// direct open or after `scan` discovers one). Meaningless for USB.
    fn address(&self) -> u8;

    /// Read the chip info block.
    fn get_info(&mut self) -> Result<InfoBlock>;

    /// Issue a reset command, optionally requesting entry into bootloader mode.
    fn reset(&mut self, into_bootloader: bool) -> Result<()>;
}

/// In-memory `Transport` used by the test suite: a queue of canned reads and
/// a log of writes, matching the scripted-mock style the pack's flashing
/// tools use for their handshake tests.
#[cfg(test)]
pub struct MockTransport {
    reads: std::collections::VecDeque<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
    pub info: InfoBlock,
    pub address: u8,
    last_read_len: usize,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            reads: std::collections::VecDeque::new(),
            writes: Vec::new(),
            info: InfoBlock {
                family_id: 0xa2,
                firmware_version: String::new(),
            },
            address: 0x4A,
            last_read_len: 0,
        }
    }

    pub fn push_read(&mut self, bytes: &[u8]) {
        self.reads.push_back(bytes.to_vec());
    }

    pub fn last_read_len(&self) -> usize {
        self.last_read_len
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let next = self
            .reads
            .pop_front()
            .expect("MockTransport: read requested with no queued bytes");
        assert_eq!(next.len(), buf.len(), "MockTransport: read size mismatch");
        buf.copy_from_slice(&next);
        self.last_read_len = buf.len();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.writes.push(buf.to_vec());
        Ok(())
    }

    fn set_slave(&mut self, _bus: u8, addr: u8) {
        self.address = addr;
    }

    fn wait_ready(&mut self) -> bool {
        true
    }

    fn scan(&mut self) -> Result<u32> {
        Ok(1)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::I2c
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn get_info(&mut self) -> Result<InfoBlock> {
        Ok(self.info.clone())
    }

    fn reset(&mut self, _into_bootloader: bool) -> Result<()> {
        Ok(())
    }
}
