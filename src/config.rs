//! Configuration types for hostcast

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Video codec requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VideoFormat {
    /// H.264/AVC - Widest compatibility
    #[default]
    H264,
    /// H.265/HEVC - Better compression
    Hevc,
    /// AV1 - Best compression
    Av1,
}

impl VideoFormat {
    /// Stable index used for per-codec capability arrays
    pub fn index(&self) -> usize {
        match self {
            VideoFormat::H264 => 0,
            VideoFormat::Hevc => 1,
            VideoFormat::Av1 => 2,
        }
    }

    /// Get human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoFormat::H264 => "H.264 (AVC)",
            VideoFormat::Hevc => "H.265 (HEVC)",
            VideoFormat::Av1 => "AV1",
        }
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Chroma subsampling requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChromaSampling {
    /// YUV 4:2:0
    #[default]
    Cs420,
    /// YUV 4:4:4 (full chroma resolution)
    Cs444,
}

/// Per-display client stream configuration
///
/// One of these arrives per monitor when a stream launches. The capture and
/// encode pair for that monitor is built entirely from this plus the global
/// [`VideoSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Stream width in pixels
    pub width: i32,
    /// Stream height in pixels
    pub height: i32,
    /// Target framerate in frames per second
    pub framerate: i32,
    /// High-precision framerate multiplied by 100 (e.g. 5994 for 59.94 fps).
    /// Takes precedence over `framerate` when positive.
    pub framerate_x100: Option<i32>,
    /// Target bitrate in kbit/s
    pub bitrate_kbps: i32,
    /// Requested slices per frame
    pub slices_per_frame: i32,
    /// Client decoder limit on reference frames (0 = encoder default)
    pub num_ref_frames: i32,
    /// Color conversion selector: bit 0 = full range, bits >= 1 pick the
    /// SDR colorspace (0 = Rec. 601, 1 = Rec. 709, 2 = Rec. 2020 SDR)
    pub encoder_csc_mode: i32,
    /// Requested codec
    pub video_format: VideoFormat,
    /// Client requested HDR (10-bit PQ)
    pub dynamic_range: bool,
    /// Requested chroma subsampling
    pub chroma_sampling: ChromaSampling,
    /// Which monitor this stream belongs to; stamped into every packet
    pub display_index: i16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 60,
            framerate_x100: None,
            bitrate_kbps: 6000,
            slices_per_frame: 1,
            num_ref_frames: 0,
            encoder_csc_mode: 0,
            video_format: VideoFormat::H264,
            dynamic_range: false,
            chroma_sampling: ChromaSampling::Cs420,
            display_index: 0,
        }
    }
}

impl ClientConfig {
    pub fn with_resolution(mut self, width: i32, height: i32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_framerate(mut self, fps: i32) -> Self {
        self.framerate = fps;
        self
    }

    pub fn with_bitrate_kbps(mut self, bitrate: i32) -> Self {
        self.bitrate_kbps = bitrate;
        self
    }

    pub fn with_video_format(mut self, format: VideoFormat) -> Self {
        self.video_format = format;
        self
    }

    pub fn with_display_index(mut self, index: i16) -> Self {
        self.display_index = index;
        self
    }

    /// Effective framerate as a rational (num, den)
    pub fn framerate_rational(&self) -> (i32, i32) {
        match self.framerate_x100 {
            Some(x100) if x100 > 0 => (x100, 100),
            _ => (self.framerate, 1),
        }
    }

    /// Reject configurations the pipeline cannot serve
    pub fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::InvalidConfig(format!(
                "invalid stream dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.framerate <= 0 && self.framerate_x100.unwrap_or(0) <= 0 {
            return Err(Error::InvalidConfig("framerate must be positive".into()));
        }
        if self.video_format == VideoFormat::H264 && self.dynamic_range {
            // 10-bit H.264 is not supported by the streaming protocol
            return Err(Error::InvalidConfig(
                "HDR is not supported with H.264".into(),
            ));
        }
        Ok(())
    }
}

/// NVENC tunables referenced by the encoder option tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NvencSettings {
    /// FFmpeg nvenc preset constant (p1 = 12 ... p7 = 18)
    pub preset: i32,
    /// Multipass mode (0 = disabled, 1 = quarter res, 2 = full res)
    pub multipass: i32,
    /// Adaptive quantization
    pub aq: i32,
    /// H.264 entropy coder (0 = auto, 1 = CABAC, 2 = CAVLC)
    pub h264_coder: i32,
    /// Extra VBV buffer headroom in percent (0 = none)
    pub vbv_percentage_increase: i32,
}

impl Default for NvencSettings {
    fn default() -> Self {
        Self {
            preset: 12,
            multipass: 1,
            aq: 0,
            h264_coder: 0,
            vbv_percentage_increase: 0,
        }
    }
}

/// QuickSync tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QsvSettings {
    /// FFmpeg qsv preset constant (1 = veryslow ... 7 = veryfast)
    pub preset: i32,
    /// Use CAVLC instead of CABAC for H.264
    pub cavlc: i32,
    /// Disable low-power HEVC encoding on GPUs where it underperforms
    pub slow_hevc: bool,
}

impl Default for QsvSettings {
    fn default() -> Self {
        Self {
            preset: 4,
            cavlc: 0,
            slow_hevc: false,
        }
    }
}

/// AMD AMF tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmdSettings {
    pub quality_h264: i32,
    pub quality_hevc: i32,
    pub quality_av1: i32,
    pub rc_h264: i32,
    pub rc_hevc: i32,
    pub rc_av1: i32,
    pub usage_h264: i32,
    pub usage_hevc: i32,
    pub usage_av1: i32,
    pub preanalysis: i32,
    pub vbaq: i32,
    pub enforce_hrd: i32,
}

impl Default for AmdSettings {
    fn default() -> Self {
        Self {
            quality_h264: 1,
            quality_hevc: 1,
            quality_av1: 1,
            rc_h264: 3,
            rc_hevc: 3,
            rc_av1: 3,
            usage_h264: 1,
            usage_hevc: 1,
            usage_av1: 1,
            preanalysis: 0,
            vbaq: 1,
            enforce_hrd: 0,
        }
    }
}

/// VideoToolbox tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoToolboxSettings {
    pub allow_sw: i32,
    pub require_sw: i32,
    pub realtime: i32,
}

impl Default for VideoToolboxSettings {
    fn default() -> Self {
        Self {
            allow_sw: 0,
            require_sw: 0,
            realtime: 1,
        }
    }
}

/// Software encoder tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareSettings {
    /// x264/x265 preset name
    pub preset: String,
    /// x264/x265 tune name
    pub tune: String,
    /// SVT-AV1 preset (0 = slowest ... 13 = fastest)
    pub svtav1_preset: i32,
}

impl Default for SoftwareSettings {
    fn default() -> Self {
        Self {
            preset: "superfast".into(),
            tune: "zerolatency".into(),
            svtav1_preset: 11,
        }
    }
}

/// Host-wide video settings
///
/// These come from the host configuration surface and apply to every
/// capture session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Preferred encoder name ("nvenc", "quicksync", "amdvce", "vaapi",
    /// "videotoolbox", "software"); empty = automatic selection
    pub encoder: String,
    /// Preferred output/monitor identifier; empty = first available
    pub output_name: String,
    /// GPU adapter name for hwdevice creation; empty = default adapter
    pub adapter_name: String,
    /// HEVC mode: 0 = auto, 1 = disabled, 2 = required, 3 = required with HDR
    pub hevc_mode: i32,
    /// AV1 mode: 0 = auto, 1 = disabled, 2 = required, 3 = required with HDR
    pub av1_mode: i32,
    /// Cap on the client-requested bitrate in kbit/s (0 = uncapped)
    pub max_bitrate_kbps: i32,
    /// Lower bound on software encoder slice/thread parallelism
    pub min_threads: i32,
    /// Minimum encode rate for static content (0 = follow client framerate)
    pub minimum_fps_target: f64,
    /// Always rewrite SPS/VPS headers even when the encoder emits valid VUI
    pub force_video_header_replace: bool,
    pub nv: NvencSettings,
    pub qsv: QsvSettings,
    pub amd: AmdSettings,
    pub vt: VideoToolboxSettings,
    pub sw: SoftwareSettings,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            encoder: String::new(),
            output_name: String::new(),
            adapter_name: String::new(),
            hevc_mode: 0,
            av1_mode: 0,
            max_bitrate_kbps: 0,
            min_threads: 2,
            minimum_fps_target: 0.0,
            force_video_header_replace: false,
            nv: NvencSettings::default(),
            qsv: QsvSettings::default(),
            amd: AmdSettings::default(),
            vt: VideoToolboxSettings::default(),
            sw: SoftwareSettings::default(),
        }
    }
}

impl VideoSettings {
    /// Effective bitrate in bit/s after applying the host cap
    pub fn effective_bitrate(&self, requested_kbps: i32) -> i64 {
        let kbps = if self.max_bitrate_kbps > 0 {
            requested_kbps.min(self.max_bitrate_kbps)
        } else {
            requested_kbps
        };
        kbps as i64 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr_h264_rejected() {
        let config = ClientConfig {
            dynamic_range: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            video_format: VideoFormat::Hevc,
            dynamic_range: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dimension_validation() {
        let config = ClientConfig::default().with_resolution(0, 1080);
        assert!(config.validate().is_err());
        let config = ClientConfig::default().with_resolution(1920, 1080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_framerate_x100_precedence() {
        let mut config = ClientConfig::default().with_framerate(60);
        assert_eq!(config.framerate_rational(), (60, 1));
        config.framerate_x100 = Some(5994);
        assert_eq!(config.framerate_rational(), (5994, 100));
        config.framerate_x100 = Some(0);
        assert_eq!(config.framerate_rational(), (60, 1));
    }

    #[test]
    fn test_bitrate_cap() {
        let mut settings = VideoSettings::default();
        assert_eq!(settings.effective_bitrate(10_000), 10_000_000);
        settings.max_bitrate_kbps = 8000;
        assert_eq!(settings.effective_bitrate(10_000), 8_000_000);
        assert_eq!(settings.effective_bitrate(5000), 5_000_000);
    }
}
