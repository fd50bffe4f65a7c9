//! # maXTouch bootloader flasher
//!
//! Drives an Atmel maXTouch-family touchscreen controller from application
//! mode into its bootloader and streams a firmware image across an I²C bus,
//! observing the chip's handshake-per-frame protocol with its one-shot
//! unlock and single-retry CRC recovery.
//!
//! This crate only drives the protocol state machine (spec'd in
//! [`state_machine`]) and the frame-by-frame orchestration on top of it
//! (spec'd in [`flash`]). Discovering a chip beyond a single scan call,
//! recovering a bricked device, and validating firmware authenticity are
//! out of scope - see [`flash::FlashSession`] for the supported entry point.

pub mod error;
pub mod flash;
pub mod i2c;
pub mod image;
pub mod state_machine;
pub mod transport;

pub use error::{FlashError, Result};
pub use flash::{FlashOutcome, FlashSession};
pub use i2c::I2cTransport;
pub use transport::{InfoBlock, Transport, TransportKind};
