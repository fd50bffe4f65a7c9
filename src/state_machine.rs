//! Bootloader handshake state machine.
//!
//! Interprets the status word the chip returns over its bootloader address
//! and decides whether to accept an unlock, accept a frame, retry, or abort.

use log::{debug, info, trace, warn};

use crate::error::{FlashError, Result};
use crate::transport::Transport;

/// Bootloader status byte carries identity in the low 6 bits; state lives in
/// the high 2 bits for `WAITING_*`/`APP_CRC_FAIL`. `CRC_*` codes use the full byte.
const BOOT_STATUS_MASK: u8 = 0x3f;

pub const WAITING_BOOTLOAD_CMD: u8 = 0xc0;
pub const WAITING_FRAME_DATA: u8 = 0x80;
pub const FRAME_CRC_CHECK: u8 = 0x02;
pub const FRAME_CRC_FAIL: u8 = 0x03;
pub const FRAME_CRC_PASS: u8 = 0x04;
pub const APP_CRC_FAIL: u8 = 0x40;

/// Bound on transient re-reads within a single handshake call, to avoid an
/// infinite spin on a stuck device that keeps reporting a transient status.
const MAX_RECHECKS: u32 = 10;

/// Identity of the bootloader, latched at most once per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootloaderIdentity {
    pub id: u8,
    pub version: u8,
    pub known: bool,
    pub extended_id_mode: bool,
}

/// Result of a single handshake call that reached a terminal, successful state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Expected state observed.
    Ok,
    /// Only valid when expecting `WAITING_BOOTLOAD_CMD`: bootloader was
    /// already unlocked, no unlock write is needed.
    AlreadyUnlocked,
}

/// Returns `true` if `err` is the specific "frame CRC check failed" terminal
/// state rather than some other unexpected status byte. The flash driver
/// uses this to decide whether the one permitted retry applies.
pub fn is_frame_crc_fail(err: &FlashError) -> bool {
    matches!(err, FlashError::InvalidState(v) if *v == FRAME_CRC_FAIL)
}

/// Drives the per-handshake status read/decide loop against a transport.
///
/// Identity (`BootloaderIdentity`) is owned by the caller and threaded in by
/// mutable reference so it can be latched across handshake calls within a
/// `FlashSession` without introducing process-wide state.
pub fn check_bootloader(
    transport: &mut dyn Transport,
    identity: &mut BootloaderIdentity,
    expected: u8,
) -> Result<HandshakeOutcome> {
    for _ in 0..MAX_RECHECKS {
        if expected != WAITING_BOOTLOAD_CMD {
            transport.wait_ready();
        }

        let val = read_status(transport, identity, expected)?;
        trace!("bootloader status 0x{:02X}", val);

        match expected {
            WAITING_BOOTLOAD_CMD => {
                let bootloader_id = val & BOOT_STATUS_MASK;
                let masked = val & !BOOT_STATUS_MASK;

                if masked == APP_CRC_FAIL {
                    info!("bootloader reports APP CRC failure, rechecking");
                    continue;
                } else if masked == WAITING_FRAME_DATA {
                    info!("bootloader already unlocked");
                    return Ok(HandshakeOutcome::AlreadyUnlocked);
                } else if masked != WAITING_BOOTLOAD_CMD {
                    return Err(FlashError::InvalidState(val));
                }

                if !identity.known {
                    if bootloader_id & 0x20 != 0 {
                        debug!("bootloader using extended ID mode");
                        identity.extended_id_mode = true;
                    } else {
                        identity.id = bootloader_id & 0x1f;
                        identity.known = true;
                        debug!("bootloader ID: {}", identity.id);
                    }
                }

                return Ok(HandshakeOutcome::Ok);
            }
            WAITING_FRAME_DATA => {
                if val == FRAME_CRC_PASS {
                    trace!("bootloader still giving CRC PASS, rechecking");
                    continue;
                }
                let masked = val & !BOOT_STATUS_MASK;
                if masked != WAITING_FRAME_DATA {
                    return Err(FlashError::InvalidState(val));
                }
                return Ok(HandshakeOutcome::Ok);
            }
            FRAME_CRC_PASS => {
                if val == FRAME_CRC_CHECK {
                    continue;
                } else if val == FRAME_CRC_FAIL {
                    warn!("bootloader reports FRAME_CRC_FAIL");
                    return Err(FlashError::InvalidState(val));
                } else if val != FRAME_CRC_PASS {
                    return Err(FlashError::InvalidState(val));
                }
                return Ok(HandshakeOutcome::Ok);
            }
            _ => return Err(FlashError::InvalidState(val)),
        }
    }

    warn!("giving up after {} transient re-reads", MAX_RECHECKS);
    Err(FlashError::InvalidState(0))
}

fn read_status(
    transport: &mut dyn Transport,
    identity: &mut BootloaderIdentity,
    expected: u8,
) -> Result<u8> {
    if !identity.known && identity.extended_id_mode && expected == WAITING_FRAME_DATA {
        info!("retrieving bootloader version (extended ID mode)");
        let mut buf = [0u8; 3];
        transport.read(&mut buf)?;
        identity.id = buf[1];
        identity.version = buf[2];
        identity.known = true;
        info!(
            "bootloader ID:{} version:{}",
            identity.id, identity.version
        );
        Ok(buf[0])
    } else {
        let mut buf = [0u8; 1];
        transport.read(&mut buf)?;
        Ok(buf[0])
    }
}
