//! Display capture interface
//!
//! The platform layer (DXGI, VAAPI, CUDA, VideoToolbox) implements these
//! traits; the capture task drives them. Nothing in this crate talks to the
//! operating system directly.

pub(crate) mod pool;
mod task;
#[cfg(test)]
pub(crate) mod testing;

pub use pool::ImagePool;
pub use task::{capture_thread, CaptureContext};

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::types::{HdrMetadata, MemType, PixelFormat};

/// Outcome of one `Display::capture` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// The backend returned control without an error; capture may resume
    Ok,
    /// The display must be torn down and rebuilt before capture can resume
    Reinit,
    Timeout,
    Interrupted,
    Error,
}

/// Cursor compositing request passed through to the backend
#[derive(Debug, Clone, Copy)]
pub struct CursorConfig {
    pub visible: bool,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self { visible: true }
    }
}

/// A raw captured frame
///
/// Allocated by the display backend, pooled by the capture task and shared
/// with every encode subscriber. Backends that keep GPU-resident state hang
/// it off `data` via their own image subclassing on the platform side; this
/// core only relies on the fields below.
#[derive(Debug, Default)]
pub struct Image {
    pub data: Vec<u8>,
    pub row_pitch: usize,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Monotonic timestamp of the capture, set by the backend
    pub frame_timestamp: Option<Instant>,
}

/// Images are shared between the capture pool, the backend writer and the
/// encode subscribers; the pool uses the strong count to detect frames
/// still in flight.
pub type SharedImage = Arc<Mutex<Image>>;

/// One display device as reported by the OS enumeration
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub friendly_name: String,
    /// Whether the OS reports the device as actively driving a display
    pub active: bool,
}

/// OS thread priority classes used by the pipeline threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    /// Capture thread priority
    Critical,
    /// Encode thread priority
    High,
}

/// Callback the backend invokes with each captured frame. Returns false to
/// make the backend stop and return from `capture`.
pub type PushCaptured<'a> = dyn FnMut(SharedImage, bool) -> bool + 'a;

/// Callback the backend invokes to obtain a free pooled image. Returning
/// `None` tells the backend to stop.
pub type PullFree<'a> = dyn FnMut() -> Option<SharedImage> + 'a;

/// One opened display, exclusively owned by its capture task
pub trait Display: Send + Sync {
    /// Captured width in pixels
    fn width(&self) -> u32;
    /// Captured height in pixels
    fn height(&self) -> u32;
    /// Desktop environment width containing this display
    fn env_width(&self) -> i32;
    /// Desktop environment height containing this display
    fn env_height(&self) -> i32;
    /// Display origin within the desktop environment
    fn offset_x(&self) -> i32;
    fn offset_y(&self) -> i32;

    /// Allocate a backend image suitable for `capture`
    fn alloc_img(&self) -> Result<SharedImage>;

    /// Fill `img` with a blank frame so the encoder has valid input before
    /// the first real capture lands
    fn dummy_img(&self, img: &SharedImage) -> Result<()>;

    fn is_hdr(&self) -> bool;

    fn hdr_metadata(&self) -> Option<HdrMetadata>;

    /// Can this display feed the named avcodec encoder with `config`?
    fn is_codec_supported(&self, codec_name: &str, config: &ClientConfig) -> bool;

    /// Run the OS capture loop. Blocks until the backend stops: either a
    /// callback asked it to, or the device was lost.
    fn capture(
        &self,
        push: &mut PushCaptured<'_>,
        pull: &mut PullFree<'_>,
        cursor: &CursorConfig,
    ) -> CaptureStatus;

    /// Build an encode device feeding an avcodec encoder in `pix_fmt`
    fn make_avcodec_encode_device(
        &self,
        pix_fmt: PixelFormat,
    ) -> Result<Box<dyn crate::encode::AvcodecEncodeDevice>>;

    /// Build an encode device feeding the native NVENC encoder
    fn make_nvenc_encode_device(
        &self,
        pix_fmt: PixelFormat,
    ) -> Result<Box<dyn crate::encode::NvencEncodeDevice>>;
}

/// Entry points into the platform display layer
pub trait DisplayBackend: Send + Sync {
    /// Stable identifiers of the displays reachable for `mem_type`, in OS
    /// enumeration order
    fn display_names(&self, mem_type: MemType) -> Vec<String>;

    /// Open a display by identifier. `None` when the device is gone or
    /// busy; the caller retries with backoff.
    fn open_display(
        &self,
        mem_type: MemType,
        name: &str,
        config: &ClientConfig,
    ) -> Option<Arc<dyn Display>>;

    /// Enumerate display devices for the probe pre-check. An empty list
    /// means the OS query layer is unsupported here.
    fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    /// Has the OS device set changed since the last probe?
    fn needs_reenumeration(&self) -> bool {
        false
    }

    /// Raise the calling thread's scheduling priority
    fn adjust_thread_priority(&self, _priority: ThreadPriority) {}
}

/// Shared slot through which the capture task publishes its display to the
/// encode task. Written only by the capture task; the encode task upgrades
/// under the lock.
pub type DisplaySlot = Arc<Mutex<Option<std::sync::Weak<dyn Display>>>>;

/// Create an empty display slot
pub fn display_slot() -> DisplaySlot {
    Arc::new(Mutex::new(None))
}
