//! hostcast — multi-display video capture and encoding core
//!
//! The video pipeline of a low-latency remote desktop / game streaming
//! host. For each active display a capture task pulls frames from the
//! platform layer and an encode task turns them into compressed packets
//! for the transport queue, staying live across display hotplug, encoder
//! failure and monitor switching.
//!
//! # Architecture
//!
//! - **Capture**: per-display OS thread driving the platform
//!   [`capture::Display`] implementation, with a pooled image ring and a
//!   rebuild protocol for device loss
//! - **Encode**: per-display OS thread wrapping an avcodec encoder
//!   (NVENC/QSV/AMF/VAAPI/VideoToolbox/x264/x265 through FFmpeg) or the
//!   native NVENC SDK
//! - **Probe**: trial encodes fill each encoder's capability matrix before
//!   the first session starts
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hostcast::{probe_encoders, run_capture, ClientConfig, Registry, StreamEvents, VideoSettings};
//!
//! fn main() -> hostcast::Result<()> {
//!     let backend: Arc<dyn hostcast::DisplayBackend> = platform_backend();
//!     let settings = Arc::new(VideoSettings::default());
//!
//!     let outcome = probe_encoders(&backend, Registry::platform_default(), &settings, None)?;
//!
//!     let events = StreamEvents::new();
//!     let configs = vec![ClientConfig::default()];
//!     run_capture(backend, events, &outcome, settings, configs, None);
//!     Ok(())
//! }
//! # fn platform_backend() -> Arc<dyn hostcast::DisplayBackend> { unimplemented!() }
//! ```

pub mod capture;
pub mod cbs;
pub mod config;
pub mod control;
pub mod encode;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod types;

// Re-exports for convenience
pub use capture::{CaptureStatus, Display, DisplayBackend, Image, SharedImage};
pub use config::{ChromaSampling, ClientConfig, VideoFormat, VideoSettings};
pub use encode::{
    probe_encoders, EncodeSession, EncoderDescriptor, EncoderFlags, ProbeOutcome, Registry,
};
pub use error::{Error, Result};
pub use events::{EventQueue, SessionEvents, Signal, StreamEvents};
pub use pipeline::{run_capture, CaptureSession};
pub use types::{Colorspace, HdrInfo, HdrMetadata, Packet, TouchPort, TouchPorts};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
