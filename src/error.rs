//! Error types for hostcast

use thiserror::Error;

/// Result type alias for hostcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// hostcast error type
#[derive(Error, Debug)]
pub enum Error {
    // Display errors
    #[error("Display acquisition failed: {0}")]
    DisplayAcquisition(String),

    #[error("No display available")]
    NoDisplay,

    #[error("Capture error: {0}")]
    Capture(String),

    // Encoder errors
    #[error("Codec not supported: {0}")]
    CodecNotSupported(String),

    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Encoder probe failed: {0}")]
    Probe(String),

    #[error("No working encoder found")]
    NoEncoderFound,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Conversion / scaling errors
    #[error("Scaling error: {0}")]
    Scaling(String),

    #[error("Colorspace conversion error: {0}")]
    ColorspaceConversion(String),

    // Bitstream rewriting errors
    #[error("Bitstream error: {0}")]
    Bitstream(String),

    // FFmpeg errors
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is recoverable by rebuilding the encode session
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::EncodingFailed(_) | Error::EncoderInit(_) | Error::DisplayAcquisition(_)
        )
    }

    /// Check if this is a hardware/driver issue
    pub fn is_hardware_issue(&self) -> bool {
        matches!(self, Error::CodecNotSupported(_) | Error::NoEncoderFound)
    }
}
