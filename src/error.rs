use thiserror::Error;

/// Errors produced while driving the maXTouch bootloader protocol.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("failed to open firmware image {path}: {source}")]
    ImageOpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("firmware image truncated inside frame {frame_no}")]
    TruncatedImage { frame_no: u32 },

    #[error("invalid hex digits in firmware image at byte offset {offset}")]
    BadHex { offset: u64 },

    #[error("frame {frame_no} size {size} exceeds maximum of 1024 bytes")]
    ImageFrameTooLarge { frame_no: u32, size: usize },

    #[error("transport I/O failure: {0}")]
    TransportIo(#[from] std::io::Error),

    #[error("bootloader not found (initial handshake did not yield a known state)")]
    BootloaderNotFound,

    #[error("unexpected bootloader status byte 0x{0:02X}")]
    InvalidState(u8),

    #[error("frame {frame_no} failed CRC check after {retries} retries")]
    FrameCrcFail { frame_no: u32, retries: u32 },

    #[error("firmware already at requested version {version}")]
    AlreadyAtVersion { version: String },

    #[error("post-flash verification failed: observed version {observed}, expected {expected}")]
    VerifyMismatch { observed: String, expected: String },

    #[error("could not re-discover device after flash")]
    PostResetScanFailed,
}

pub type Result<T> = std::result::Result<T, FlashError>;
