//! Common types used throughout hostcast

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::color;
use ffmpeg_next::format::Pixel;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;

/// Pixel formats exchanged between the platform layer and the encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PixelFormat {
    /// No format (software-only encoder slot)
    #[default]
    None,
    /// NV12 - Y plane + interleaved UV
    Nv12,
    /// P010 - 10-bit NV12 (HDR)
    P010,
    /// AYUV / VUYX packed 4:4:4 8-bit
    Ayuv,
    /// Y410 / XV30 packed 4:4:4 10-bit
    Y410,
    /// Planar YUV 4:2:0 8-bit
    Yuv420p,
    /// Planar YUV 4:2:0 10-bit
    Yuv420p10,
    /// Planar YUV 4:4:4 8-bit
    Yuv444p,
    /// Planar YUV 4:4:4 10-bit
    Yuv444p10,
    /// Planar YUV 4:4:4 16-bit
    Yuv444p16,
    /// BGR with unused alpha, the common desktop capture layout
    Bgr0,
    /// D3D11 texture memory
    D3d11,
    /// CUDA device memory
    Cuda,
    /// VAAPI surface
    Vaapi,
    /// QSV surface
    Qsv,
    /// VideoToolbox surface
    VideoToolbox,
}

impl PixelFormat {
    /// Map to the FFmpeg pixel format
    pub fn to_av(self) -> Pixel {
        match self {
            PixelFormat::None => Pixel::None,
            PixelFormat::Nv12 => Pixel::NV12,
            PixelFormat::P010 => Pixel::P010LE,
            PixelFormat::Ayuv => Pixel::VUYX,
            PixelFormat::Y410 => Pixel::XV30LE,
            PixelFormat::Yuv420p => Pixel::YUV420P,
            PixelFormat::Yuv420p10 => Pixel::YUV420P10LE,
            PixelFormat::Yuv444p => Pixel::YUV444P,
            PixelFormat::Yuv444p10 => Pixel::YUV444P10LE,
            PixelFormat::Yuv444p16 => Pixel::YUV444P16LE,
            PixelFormat::Bgr0 => Pixel::BGRZ,
            PixelFormat::D3d11 => Pixel::D3D11,
            PixelFormat::Cuda => Pixel::CUDA,
            PixelFormat::Vaapi => Pixel::VAAPI,
            PixelFormat::Qsv => Pixel::QSV,
            PixelFormat::VideoToolbox => Pixel::VIDEOTOOLBOX,
        }
    }
}

/// Hardware device context type used by the AVCODEC encode path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwDeviceType {
    /// Software encoding, no hwdevice
    #[default]
    None,
    D3d11va,
    Vaapi,
    Cuda,
    Qsv,
    VideoToolbox,
}

impl HwDeviceType {
    pub fn to_av(self) -> ffmpeg::ffi::AVHWDeviceType {
        use ffmpeg::ffi::AVHWDeviceType::*;
        match self {
            HwDeviceType::None => AV_HWDEVICE_TYPE_NONE,
            HwDeviceType::D3d11va => AV_HWDEVICE_TYPE_D3D11VA,
            HwDeviceType::Vaapi => AV_HWDEVICE_TYPE_VAAPI,
            HwDeviceType::Cuda => AV_HWDEVICE_TYPE_CUDA,
            HwDeviceType::Qsv => AV_HWDEVICE_TYPE_QSV,
            HwDeviceType::VideoToolbox => AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
        }
    }

    /// Memory domain the platform layer captures into for this device type
    pub fn mem_type(self) -> MemType {
        match self {
            HwDeviceType::None => MemType::System,
            HwDeviceType::D3d11va => MemType::Dxgi,
            HwDeviceType::Vaapi => MemType::Vaapi,
            HwDeviceType::Cuda => MemType::Cuda,
            HwDeviceType::Qsv => MemType::Dxgi,
            HwDeviceType::VideoToolbox => MemType::VideoToolbox,
        }
    }
}

/// Capture memory domain, used to select the platform display backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemType {
    #[default]
    System,
    Dxgi,
    Vaapi,
    Cuda,
    VideoToolbox,
}

/// Colorspace family carried by the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorspaceKind {
    Rec601,
    #[default]
    Rec709,
    Bt2020Sdr,
    /// Rec. 2020 with SMPTE 2084 PQ transfer (HDR)
    Bt2020Pq,
}

/// Resolved stream colorspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colorspace {
    pub kind: ColorspaceKind,
    pub bit_depth: u8,
    pub full_range: bool,
}

impl Default for Colorspace {
    fn default() -> Self {
        Self {
            kind: ColorspaceKind::Rec709,
            bit_depth: 8,
            full_range: false,
        }
    }
}

impl Colorspace {
    /// Derive the stream colorspace from the client request and the
    /// display's HDR state
    pub fn from_client_config(config: &ClientConfig, display_is_hdr: bool) -> Self {
        let kind = if config.dynamic_range && display_is_hdr {
            ColorspaceKind::Bt2020Pq
        } else {
            match config.encoder_csc_mode >> 1 {
                0 => ColorspaceKind::Rec601,
                1 => ColorspaceKind::Rec709,
                2 => ColorspaceKind::Bt2020Sdr,
                other => {
                    tracing::warn!("Unknown CSC mode {}, falling back to Rec. 601", other);
                    ColorspaceKind::Rec601
                }
            }
        };

        Self {
            kind,
            bit_depth: if config.dynamic_range { 10 } else { 8 },
            full_range: (config.encoder_csc_mode & 0x1) != 0,
        }
    }

    pub fn is_hdr(&self) -> bool {
        self.kind == ColorspaceKind::Bt2020Pq
    }

    /// Human-readable description for the session log
    pub fn describe(&self) -> &'static str {
        match self.kind {
            ColorspaceKind::Rec601 => "SDR (Rec. 601)",
            ColorspaceKind::Rec709 => "SDR (Rec. 709)",
            ColorspaceKind::Bt2020Sdr => "SDR (Rec. 2020)",
            ColorspaceKind::Bt2020Pq => "HDR (Rec. 2020 + SMPTE 2084 PQ)",
        }
    }
}

/// Avcodec color metadata derived from a [`Colorspace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvColorMapping {
    pub range: color::Range,
    pub primaries: color::Primaries,
    pub transfer: color::TransferCharacteristic,
    pub matrix: color::Space,
}

impl From<Colorspace> for AvColorMapping {
    fn from(cs: Colorspace) -> Self {
        let (primaries, transfer, matrix) = match cs.kind {
            ColorspaceKind::Rec601 => (
                color::Primaries::SMPTE170M,
                color::TransferCharacteristic::SMPTE170M,
                color::Space::SMPTE170M,
            ),
            ColorspaceKind::Rec709 => (
                color::Primaries::BT709,
                color::TransferCharacteristic::BT709,
                color::Space::BT709,
            ),
            ColorspaceKind::Bt2020Sdr => (
                color::Primaries::BT2020,
                color::TransferCharacteristic::BT2020_10,
                color::Space::BT2020NCL,
            ),
            ColorspaceKind::Bt2020Pq => (
                color::Primaries::BT2020,
                color::TransferCharacteristic::SMPTE2084,
                color::Space::BT2020NCL,
            ),
        };

        Self {
            range: if cs.full_range {
                color::Range::JPEG
            } else {
                color::Range::MPEG
            },
            primaries,
            transfer,
            matrix,
        }
    }
}

impl Colorspace {
    /// swscale coefficient table selector for this colorspace
    pub fn sws_coefficients(&self) -> i32 {
        match self.kind {
            ColorspaceKind::Rec601 => ffmpeg::ffi::SWS_CS_ITU601 as i32,
            ColorspaceKind::Rec709 => ffmpeg::ffi::SWS_CS_ITU709 as i32,
            ColorspaceKind::Bt2020Sdr | ColorspaceKind::Bt2020Pq => {
                ffmpeg::ffi::SWS_CS_BT2020 as i32
            }
        }
    }
}

/// A display chromaticity coordinate in 0.00002 units (SMPTE ST 2086)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrPoint {
    pub x: u16,
    pub y: u16,
}

/// HDR static metadata reported by the display
#[derive(Debug, Clone, Copy, Default)]
pub struct HdrMetadata {
    /// Red, green, blue primaries
    pub display_primaries: [HdrPoint; 3],
    pub white_point: HdrPoint,
    /// Peak luminance in nits
    pub max_display_luminance: u32,
    /// Minimum luminance in 0.0001 nit units
    pub min_display_luminance: u32,
    pub max_content_light_level: u16,
    pub max_frame_average_light_level: u16,
}

/// HDR state published to the client when an encode session starts
#[derive(Debug, Clone, Default)]
pub struct HdrInfo {
    pub enabled: bool,
    pub metadata: HdrMetadata,
}

/// One staged bitstream substitution: downstream replaces `old` with `new`
/// verbatim before transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// Shared list of header replacements owned by an encode session
pub type ReplacementList = Arc<Mutex<Vec<Replacement>>>;

/// Opaque routing handle carried through to the transport layer
pub type ChannelData = Arc<dyn Any + Send + Sync>;

/// A compressed video packet handed to the transport queue
pub struct Packet {
    /// Encoded bitstream
    pub data: Vec<u8>,
    /// Monotonic frame counter within one display's stream
    pub frame_index: i64,
    /// Is this an IDR random access point?
    pub idr: bool,
    /// First frame following a successful reference frame invalidation
    pub after_ref_frame_invalidation: bool,
    /// Capture timestamp of the encoded frame, when known
    pub frame_timestamp: Option<Instant>,
    /// Header byte-range substitutions (AVCODEC sessions only)
    pub replacements: Option<ReplacementList>,
    /// Opaque transport routing handle
    pub channel_data: Option<ChannelData>,
    /// Monitor this packet belongs to; the only routing key downstream
    pub display_index: i16,
}

impl Packet {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_idr(&self) -> bool {
        self.idr
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.data.len())
            .field("frame_index", &self.frame_index)
            .field("idr", &self.idr)
            .field("display_index", &self.display_index)
            .finish()
    }
}

/// Rectangle translating absolute pointer input into one display's
/// coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TouchPort {
    /// Display origin in the desktop environment
    pub offset_x: i32,
    pub offset_y: i32,
    /// Client stream dimensions
    pub width: i32,
    pub height: i32,
    /// Desktop environment dimensions
    pub env_width: i32,
    pub env_height: i32,
    /// Letterbox padding inside the client viewport
    pub scale_offset_x: f32,
    pub scale_offset_y: f32,
    /// Client-to-display coordinate scale
    pub inverse_scalar: f32,
}

impl TouchPort {
    fn right(&self) -> i32 {
        self.offset_x + self.width
    }

    fn bottom(&self) -> i32 {
        self.offset_y + self.height
    }
}

/// Non-overlapping input geometry across all active displays
///
/// `full` is always the minimum axis-aligned bounding rectangle of every
/// port in environment coordinates, or zeroed when no port is active.
#[derive(Debug, Clone, Default)]
pub struct TouchPorts {
    pub ports: BTreeMap<i16, TouchPort>,
    pub full: TouchPort,
}

impl TouchPorts {
    /// Recompute the bounding rectangle after any insert or remove
    pub(crate) fn recompute_full(&mut self) {
        let mut iter = self.ports.values();
        let Some(first) = iter.next() else {
            self.full = TouchPort::default();
            return;
        };

        let mut full = *first;
        for port in iter {
            let left = full.offset_x.min(port.offset_x);
            let top = full.offset_y.min(port.offset_y);
            let right = full.right().max(port.right());
            let bottom = full.bottom().max(port.bottom());
            full.offset_x = left;
            full.offset_y = top;
            full.width = right - left;
            full.height = bottom - top;
        }
        self.full = full;
    }
}
