//! Linux i2c-dev `Transport` implementation.
//!
//! Generalizes `twiboot-flasher`'s `TwiI2CDevice` (a single fixed-protocol
//! TWI channel) into an implementation of the abstract maXTouch `Transport`
//! capability set: plain `read`/`write` of raw bytes, slave address
//! switching between application and bootloader mode, and the info-block/
//! reset commands the flash driver needs around those reads.

use std::thread;
use std::time::Duration;

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use log::debug;

use crate::error::{FlashError, Result};
use crate::transport::{InfoBlock, Transport, TransportKind};

const WRITE_RETRY_COUNT: usize = 50;
const WRITE_RETRY_DELAY_MS: u64 = 2;

/// maXTouch info block command/subcommand pair and its fixed response length.
const CMD_GET_INFO: u8 = 0x02;
const INFO_BLOCK_LEN: usize = 7;
const CMD_RESET: u8 = 0x01;
const RESET_BOOTLOADER: u8 = 0xA5;
const RESET_APPLICATION: u8 = 0x00;

/// Application-mode I2C slave addresses the maXTouch family may respond to,
/// probed in address order when the caller does not supply one.
const CANDIDATE_APPMODE_ADDRESSES: [u8; 6] = [0x4A, 0x4B, 0x4C, 0x4D, 0x5A, 0x5B];

fn io_err(e: impl std::fmt::Display) -> FlashError {
    FlashError::TransportIo(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

pub struct I2cTransport {
    device: LinuxI2CDevice,
    bus: u8,
    address: u8,
}

impl I2cTransport {
    /// Opens a transport bound to `address`, or, if `address` is `None`,
    /// probes `CANDIDATE_APPMODE_ADDRESSES` in order and binds to the first
    /// one that acknowledges a read.
    pub fn new(bus: u8, address: Option<u8>) -> Result<Self> {
        match address {
            Some(address) => {
                let device = Self::open(bus, address).map_err(io_err)?;
                Ok(I2cTransport {
                    device,
                    bus,
                    address,
                })
            }
            None => {
                for &candidate in CANDIDATE_APPMODE_ADDRESSES.iter() {
                    let Ok(mut device) = Self::open(bus, candidate) else {
                        continue;
                    };
                    if device.read(&mut [0u8; 1]).is_ok() {
                        debug!("found device on bus {} at address 0x{:02X}", bus, candidate);
                        return Ok(I2cTransport {
                            device,
                            bus,
                            address: candidate,
                        });
                    }
                }
                Err(io_err(format!(
                    "no device found on bus {} (probed {} candidate addresses)",
                    bus,
                    CANDIDATE_APPMODE_ADDRESSES.len()
                )))
            }
        }
    }

    fn open(bus: u8, address: u8) -> std::result::Result<LinuxI2CDevice, i2cdev::linux::LinuxI2CError> {
        let device_path = format!("/dev/i2c-{}", bus);
        LinuxI2CDevice::new(&device_path, address as u16)
    }

    fn write_with_retry(&mut self, data: &[u8]) -> Result<()> {
        let mut retries = WRITE_RETRY_COUNT;

        loop {
            match self.device.write(data) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    // Most I2C errors are retryable (slave not acknowledging
                    // yet, still processing the previous command).
                    if retries == 0 {
                        return Err(io_err(format!(
                            "I2C write failed after {} retries: {}",
                            WRITE_RETRY_COUNT, e
                        )));
                    }
                }
            }

            retries -= 1;
            thread::sleep(Duration::from_millis(WRITE_RETRY_DELAY_MS));
        }
    }
}

impl Transport for I2cTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.device.read(buf).map_err(io_err)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_with_retry(buf)
    }

    fn set_slave(&mut self, bus: u8, addr: u8) {
        if bus != self.bus || addr != self.address {
            debug!("switching i2c slave to bus {} address 0x{:02X}", bus, addr);
            match Self::open(bus, addr) {
                Ok(device) => {
                    self.device = device;
                    self.bus = bus;
                    self.address = addr;
                }
                Err(e) => {
                    log::error!("failed to switch i2c slave address: {}", e);
                }
            }
        }
    }

    fn wait_ready(&mut self) -> bool {
        // No CHG line available over plain i2c-dev; use a fixed delay instead
        // of polling an interrupt line.
        thread::sleep(Duration::from_millis(50));
        true
    }

    fn scan(&mut self) -> Result<u32> {
        // Confirm the bound address still acknowledges; `new` already did
        // the address discovery when the caller supplied none.
        match self.device.read(&mut [0u8; 1]) {
            Ok(_) => Ok(1),
            Err(_) => Ok(0),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::I2c
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn get_info(&mut self) -> Result<InfoBlock> {
        self.write_with_retry(&[CMD_GET_INFO])?;
        let mut buf = [0u8; INFO_BLOCK_LEN];
        self.read(&mut buf)?;

        let family_id = buf[0];
        let version = format!("{}.{}.{:02X}", buf[1], buf[2], buf[3]);

        Ok(InfoBlock {
            family_id,
            firmware_version: version,
        })
    }

    fn reset(&mut self, into_bootloader: bool) -> Result<()> {
        let param = if into_bootloader {
            RESET_BOOTLOADER
        } else {
            RESET_APPLICATION
        };
        self.write_with_retry(&[CMD_RESET, param])
    }
}
