//! Firmware image reader.
//!
//! Reads an ASCII-hex encoded firmware image and produces a lazy, finite
//! sequence of self-contained `Frame`s. Parsing is strictly two hex
//! characters per byte, consecutive — no whitespace or newline handling is
//! assumed between bytes.

use std::io::Read;

use log::debug;

use crate::error::{FlashError, Result};

/// Maximum frame size (header + payload + CRC) accepted from an image.
pub const MAX_FRAME_SIZE: usize = 1024;

/// A single self-contained frame: the 2-byte size header, payload, and
/// 2-byte CRC trailer, ready to hand to the transport as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Reads two hex characters at a time from `src` and assembles them into
/// `Frame`s. `frame_no` is 1-based, matching the numbering used in error
/// messages and progress logs by the flash driver.
pub struct ImageReader<R> {
    src: R,
    next_frame_no: u32,
    bytes_consumed: u64,
}

impl<R: Read> ImageReader<R> {
    pub fn new(src: R) -> Self {
        ImageReader {
            src,
            next_frame_no: 1,
            bytes_consumed: 0,
        }
    }

    /// Reads the next frame, or `None` at a clean end-of-file between frames.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame_no = self.next_frame_no;

        let Some(hi) = self.read_hex_byte()? else {
            return Ok(None);
        };

        let lo = self
            .read_hex_byte()?
            .ok_or(FlashError::TruncatedImage { frame_no })?;

        let payload_len = ((hi as usize) << 8) | lo as usize;
        let frame_size = payload_len + 2 + 2;

        if frame_size > MAX_FRAME_SIZE {
            return Err(FlashError::ImageFrameTooLarge {
                frame_no,
                size: frame_size,
            });
        }

        let mut bytes = Vec::with_capacity(frame_size);
        bytes.push(hi);
        bytes.push(lo);

        for _ in 0..(payload_len + 2) {
            let b = self
                .read_hex_byte()?
                .ok_or(FlashError::TruncatedImage { frame_no })?;
            bytes.push(b);
        }

        debug!("parsed frame {}: {} bytes", frame_no, bytes.len());

        self.next_frame_no += 1;
        Ok(Some(Frame { bytes }))
    }

    fn read_hex_byte(&mut self) -> Result<Option<u8>> {
        let offset = self.bytes_consumed;
        let mut pair = [0u8; 2];
        let n = read_fill(&mut self.src, &mut pair[..1])?;
        if n == 0 {
            return Ok(None);
        }
        let n2 = read_fill(&mut self.src, &mut pair[1..2])?;
        if n2 == 0 {
            return Err(FlashError::TruncatedImage {
                frame_no: self.next_frame_no,
            });
        }
        self.bytes_consumed += 2;

        let s = std::str::from_utf8(&pair).map_err(|_| FlashError::BadHex { offset })?;
        u8::from_str_radix(s, 16)
            .map(Some)
            .map_err(|_| FlashError::BadHex { offset })
    }
}

fn read_fill(src: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    match src.read(buf) {
        Ok(0) => Ok(0),
        Ok(n) => Ok(n),
        Err(e) => Err(FlashError::TransportIo(e)),
    }
}
