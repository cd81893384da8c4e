//! Video encoding module
//!
//! The encoder registry: a fixed, ordered catalog of encoder descriptors,
//! each carrying its platform format bundle, per-codec option tables and a
//! capability matrix filled in by the prober. Probing selects exactly one
//! active encoder for the lifetime of the process.

pub mod device;
pub mod factory;
pub mod options;
pub mod probe;
pub mod session;
pub mod task;

pub use device::{
    AvcodecEncodeDevice, EncodeDevice, NvencEncodeDevice, NvencEncodedFrame, SoftwareEncodeDevice,
};
pub use factory::{make_encode_device, make_encode_session};
pub use probe::{probe_encoders, ProbeOutcome};
pub use session::EncodeSession;
pub use task::encode_thread;

use bitflags::bitflags;

use crate::config::{ClientConfig, VideoFormat, VideoSettings};
use crate::types::{HwDeviceType, MemType, PixelFormat};

bitflags! {
    /// Static behavior quirks of one encoder implementation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncoderFlags: u32 {
        /// Capture and encoding can run concurrently on separate threads
        const PARALLEL_ENCODING = 1 << 1;
        /// When HEVC is too heavy
        const H264_ONLY = 1 << 2;
        /// Some encoders don't like an infinite GOP size, e.g. VAAPI
        const LIMITED_GOP_SIZE = 1 << 3;
        /// Never use multiple slices
        const SINGLE_SLICE_ONLY = 1 << 4;
        /// Use a VBR rate control mode to simulate CBR
        const CBR_WITH_VBR = 1 << 5;
        /// Use unofficial standard-compliance mode
        const RELAXED_COMPLIANCE = 1 << 6;
        /// Don't set rc_buffer_size
        const NO_RC_BUF_LIMIT = 1 << 7;
        /// Supports reference frame invalidation
        const REF_FRAMES_INVALIDATION = 1 << 8;
        /// Encoder of last resort; aggressively probe for a better one
        const ALWAYS_REPROBE = 1 << 9;
        /// May support 4:4:4 chroma sampling depending on hardware
        const YUV444_SUPPORT = 1 << 10;
        /// Session teardown may run on a detached thread
        const ASYNC_TEARDOWN = 1 << 11;
    }
}

/// Probed capability matrix for one codec on one encoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The codec passed a trial encode
    pub passed: bool,
    /// The encoder honors a client reference frame limit
    pub ref_frames_restrict: bool,
    /// 10-bit HDR encoding works
    pub dynamic_range: bool,
    /// YUV 4:4:4 encoding works
    pub yuv444: bool,
    /// Emitted SPS contains valid VUI parameters
    pub vui_parameters: bool,
}

impl Capabilities {
    pub fn set_all(&mut self) {
        *self = Self {
            passed: true,
            ref_frames_restrict: true,
            dynamic_range: true,
            yuv444: true,
            vui_parameters: true,
        };
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One codec option value
///
/// Options either carry a literal, or compute their value from the host
/// settings / client config when the session is built.
#[derive(Clone)]
pub enum OptionValue {
    Int(i64),
    Str(&'static str),
    /// Integer drawn from the host settings
    SettingsInt(fn(&VideoSettings) -> i64),
    /// Integer drawn from the host settings, skipped when `None`
    SettingsOptInt(fn(&VideoSettings) -> Option<i64>),
    /// String drawn from the host settings, skipped when empty
    SettingsStr(fn(&VideoSettings) -> String),
    /// String computed from the client config
    ClientStr(fn(&ClientConfig) -> String),
}

/// A named codec option applied when opening the encoder
#[derive(Clone)]
pub struct EncoderOption {
    pub name: &'static str,
    pub value: OptionValue,
}

impl EncoderOption {
    pub fn int(name: &'static str, value: i64) -> Self {
        Self {
            name,
            value: OptionValue::Int(value),
        }
    }

    pub fn str(name: &'static str, value: &'static str) -> Self {
        Self {
            name,
            value: OptionValue::Str(value),
        }
    }

    pub fn settings(name: &'static str, value: fn(&VideoSettings) -> i64) -> Self {
        Self {
            name,
            value: OptionValue::SettingsInt(value),
        }
    }

    pub fn settings_str(name: &'static str, value: fn(&VideoSettings) -> String) -> Self {
        Self {
            name,
            value: OptionValue::SettingsStr(value),
        }
    }

    pub fn client_str(name: &'static str, value: fn(&ClientConfig) -> String) -> Self {
        Self {
            name,
            value: OptionValue::ClientStr(value),
        }
    }
}

/// Per-codec subdescriptor: the avcodec encoder name plus its option sets
/// and probed capabilities
#[derive(Clone, Default)]
pub struct CodecSupport {
    /// avcodec encoder name, e.g. "h264_nvenc"; empty when this codec is
    /// not provided by the encoder
    pub name: &'static str,
    pub common_options: Vec<EncoderOption>,
    pub sdr_options: Vec<EncoderOption>,
    pub hdr_options: Vec<EncoderOption>,
    pub sdr444_options: Vec<EncoderOption>,
    pub hdr444_options: Vec<EncoderOption>,
    pub fallback_options: Vec<EncoderOption>,
    pub caps: Capabilities,
}

impl CodecSupport {
    fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn available(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Pixel format bundle for the AVCODEC encode path
#[derive(Clone)]
pub struct AvcodecFormats {
    pub base_dev_type: HwDeviceType,
    pub derived_dev_type: HwDeviceType,
    /// Device-memory format the codec context runs in
    pub dev_pix_fmt: PixelFormat,
    pub pix_fmt_8bit: PixelFormat,
    pub pix_fmt_10bit: PixelFormat,
    pub pix_fmt_yuv444_8bit: PixelFormat,
    pub pix_fmt_yuv444_10bit: PixelFormat,
    /// Creates the base hwdevice context for this encoder
    pub init_hw_device: Option<factory::InitHwDeviceFn>,
}

/// Pixel format bundle for the native NVENC path
#[derive(Clone)]
pub struct NvencFormats {
    pub mem_type: MemType,
    pub pix_fmt_8bit: PixelFormat,
    pub pix_fmt_10bit: PixelFormat,
    pub pix_fmt_yuv444_8bit: PixelFormat,
    pub pix_fmt_yuv444_10bit: PixelFormat,
}

/// Which encode path a descriptor drives
#[derive(Clone)]
pub enum PlatformFormats {
    Avcodec(AvcodecFormats),
    Nvenc(NvencFormats),
}

impl PlatformFormats {
    /// Memory domain the display must capture into
    pub fn mem_type(&self) -> MemType {
        match self {
            PlatformFormats::Avcodec(fmt) => fmt.base_dev_type.mem_type(),
            PlatformFormats::Nvenc(fmt) => fmt.mem_type,
        }
    }

    /// Select the software pixel format for a bit depth and chroma request
    pub fn sw_pix_fmt(&self, bit_depth: u8, yuv444: bool) -> PixelFormat {
        let (f8, f10, f444_8, f444_10) = match self {
            PlatformFormats::Avcodec(fmt) => (
                fmt.pix_fmt_8bit,
                fmt.pix_fmt_10bit,
                fmt.pix_fmt_yuv444_8bit,
                fmt.pix_fmt_yuv444_10bit,
            ),
            PlatformFormats::Nvenc(fmt) => (
                fmt.pix_fmt_8bit,
                fmt.pix_fmt_10bit,
                fmt.pix_fmt_yuv444_8bit,
                fmt.pix_fmt_yuv444_10bit,
            ),
        };
        match (bit_depth, yuv444) {
            (10, true) => f444_10,
            (10, false) => f10,
            (_, true) => f444_8,
            (_, false) => f8,
        }
    }
}

/// One entry of the encoder registry
#[derive(Clone)]
pub struct EncoderDescriptor {
    pub name: &'static str,
    pub formats: PlatformFormats,
    pub av1: CodecSupport,
    pub hevc: CodecSupport,
    pub h264: CodecSupport,
    pub flags: EncoderFlags,
}

impl EncoderDescriptor {
    pub fn codec_support(&self, format: VideoFormat) -> &CodecSupport {
        match format {
            VideoFormat::H264 => &self.h264,
            VideoFormat::Hevc => &self.hevc,
            VideoFormat::Av1 => &self.av1,
        }
    }

    pub fn codec_support_mut(&mut self, format: VideoFormat) -> &mut CodecSupport {
        match format {
            VideoFormat::H264 => &mut self.h264,
            VideoFormat::Hevc => &mut self.hevc,
            VideoFormat::Av1 => &mut self.av1,
        }
    }
}

/// NVENC profile constants as understood by the avcodec nvenc wrappers
pub(crate) mod nv {
    pub const PROFILE_HEVC_MAIN: i64 = 0;
    pub const PROFILE_HEVC_MAIN_10: i64 = 1;
    pub const PROFILE_H264_HIGH: i64 = 2;

    /// FFmpeg nvenc "tune" constant for ultra low latency
    pub const TUNING_ULTRA_LOW_LATENCY: i64 = 3;
    /// FFmpeg nvenc "rc" constant for CBR
    pub const RC_CBR: i64 = 2;
}

/// QuickSync profile constants as understood by the avcodec qsv wrappers
pub(crate) mod qsv {
    pub const PROFILE_H264_HIGH: i64 = 100;
    pub const PROFILE_H264_HIGH_444P: i64 = 244;
    pub const PROFILE_HEVC_MAIN: i64 = 1;
    pub const PROFILE_HEVC_MAIN_10: i64 = 2;
    pub const PROFILE_HEVC_REXT: i64 = 4;
    pub const PROFILE_AV1_MAIN: i64 = 1;
    pub const PROFILE_AV1_HIGH: i64 = 2;
}

fn profile_option(value: i64) -> Vec<EncoderOption> {
    vec![EncoderOption::int("profile", value)]
}

/// NVENC through the native SDK (Windows)
pub fn nvenc_native() -> EncoderDescriptor {
    EncoderDescriptor {
        name: "nvenc",
        formats: PlatformFormats::Nvenc(NvencFormats {
            mem_type: MemType::Dxgi,
            pix_fmt_8bit: PixelFormat::Nv12,
            pix_fmt_10bit: PixelFormat::P010,
            pix_fmt_yuv444_8bit: PixelFormat::Ayuv,
            pix_fmt_yuv444_10bit: PixelFormat::Yuv444p16,
        }),
        av1: CodecSupport::named("av1_nvenc"),
        hevc: CodecSupport::named("hevc_nvenc"),
        h264: CodecSupport::named("h264_nvenc"),
        flags: EncoderFlags::PARALLEL_ENCODING
            | EncoderFlags::REF_FRAMES_INVALIDATION
            | EncoderFlags::YUV444_SUPPORT
            | EncoderFlags::ASYNC_TEARDOWN,
    }
}

/// NVENC through avcodec (CUDA capture path)
pub fn nvenc_avcodec() -> EncoderDescriptor {
    let common = || {
        vec![
            EncoderOption::int("delay", 0),
            EncoderOption::int("forced-idr", 1),
            EncoderOption::int("zerolatency", 1),
            EncoderOption::int("surfaces", 1),
            EncoderOption::int("cbr_padding", 0),
            EncoderOption::settings("preset", |s| s.nv.preset as i64),
            EncoderOption::int("tune", nv::TUNING_ULTRA_LOW_LATENCY),
            EncoderOption::int("rc", nv::RC_CBR),
            EncoderOption::settings("multipass", |s| s.nv.multipass as i64),
            EncoderOption::settings("aq", |s| s.nv.aq as i64),
        ]
    };

    let mut h264_common = common();
    h264_common.push(EncoderOption::settings("coder", |s| s.nv.h264_coder as i64));

    EncoderDescriptor {
        name: "nvenc",
        formats: PlatformFormats::Avcodec(AvcodecFormats {
            base_dev_type: HwDeviceType::Cuda,
            derived_dev_type: HwDeviceType::None,
            dev_pix_fmt: PixelFormat::Cuda,
            pix_fmt_8bit: PixelFormat::Nv12,
            pix_fmt_10bit: PixelFormat::P010,
            pix_fmt_yuv444_8bit: PixelFormat::None,
            pix_fmt_yuv444_10bit: PixelFormat::None,
            init_hw_device: Some(factory::init_cuda_device),
        }),
        av1: CodecSupport {
            common_options: common(),
            ..CodecSupport::named("av1_nvenc")
        },
        hevc: CodecSupport {
            common_options: common(),
            sdr_options: profile_option(nv::PROFILE_HEVC_MAIN),
            hdr_options: profile_option(nv::PROFILE_HEVC_MAIN_10),
            ..CodecSupport::named("hevc_nvenc")
        },
        h264: CodecSupport {
            common_options: h264_common,
            sdr_options: profile_option(nv::PROFILE_H264_HIGH),
            ..CodecSupport::named("h264_nvenc")
        },
        flags: EncoderFlags::PARALLEL_ENCODING,
    }
}

/// Intel QuickSync through avcodec
pub fn quicksync() -> EncoderDescriptor {
    let common = || {
        vec![
            EncoderOption::settings("preset", |s| s.qsv.preset as i64),
            EncoderOption::int("forced_idr", 1),
            EncoderOption::int("async_depth", 1),
            EncoderOption::int("low_delay_brc", 1),
            EncoderOption::int("low_power", 1),
        ]
    };

    let mut hevc_common = common();
    hevc_common.push(EncoderOption::int("recovery_point_sei", 0));
    hevc_common.push(EncoderOption::int("pic_timing_sei", 0));

    let mut h264_common = common();
    h264_common.insert(1, EncoderOption::settings("cavlc", |s| s.qsv.cavlc as i64));
    h264_common.push(EncoderOption::int("recovery_point_sei", 0));
    h264_common.push(EncoderOption::int("vcm", 1));
    h264_common.push(EncoderOption::int("pic_timing_sei", 0));
    h264_common.push(EncoderOption::int("max_dec_frame_buffering", 1));

    EncoderDescriptor {
        name: "quicksync",
        formats: PlatformFormats::Avcodec(AvcodecFormats {
            base_dev_type: HwDeviceType::D3d11va,
            derived_dev_type: HwDeviceType::Qsv,
            dev_pix_fmt: PixelFormat::Qsv,
            pix_fmt_8bit: PixelFormat::Nv12,
            pix_fmt_10bit: PixelFormat::P010,
            pix_fmt_yuv444_8bit: PixelFormat::Ayuv,
            pix_fmt_yuv444_10bit: PixelFormat::Y410,
            init_hw_device: Some(factory::init_dxgi_device),
        }),
        av1: CodecSupport {
            common_options: common(),
            sdr_options: profile_option(qsv::PROFILE_AV1_MAIN),
            hdr_options: profile_option(qsv::PROFILE_AV1_MAIN),
            sdr444_options: profile_option(qsv::PROFILE_AV1_HIGH),
            hdr444_options: profile_option(qsv::PROFILE_AV1_HIGH),
            ..CodecSupport::named("av1_qsv")
        },
        hevc: CodecSupport {
            common_options: hevc_common,
            sdr_options: profile_option(qsv::PROFILE_HEVC_MAIN),
            hdr_options: profile_option(qsv::PROFILE_HEVC_MAIN_10),
            sdr444_options: profile_option(qsv::PROFILE_HEVC_REXT),
            hdr444_options: profile_option(qsv::PROFILE_HEVC_REXT),
            fallback_options: vec![EncoderOption::settings("low_power", |s| {
                i64::from(!s.qsv.slow_hevc)
            })],
            ..CodecSupport::named("hevc_qsv")
        },
        h264: CodecSupport {
            common_options: h264_common,
            sdr_options: profile_option(qsv::PROFILE_H264_HIGH),
            sdr444_options: profile_option(qsv::PROFILE_H264_HIGH_444P),
            // Some old/low-end Intel GPUs don't support low power encoding
            fallback_options: vec![EncoderOption::int("low_power", 0)],
            ..CodecSupport::named("h264_qsv")
        },
        flags: EncoderFlags::PARALLEL_ENCODING
            | EncoderFlags::CBR_WITH_VBR
            | EncoderFlags::RELAXED_COMPLIANCE
            | EncoderFlags::NO_RC_BUF_LIMIT
            | EncoderFlags::YUV444_SUPPORT,
    }
}

/// AMD AMF through avcodec
pub fn amdvce() -> EncoderDescriptor {
    fn log_to_dbg(_s: &VideoSettings) -> i64 {
        i64::from(tracing::enabled!(tracing::Level::DEBUG))
    }

    EncoderDescriptor {
        name: "amdvce",
        formats: PlatformFormats::Avcodec(AvcodecFormats {
            base_dev_type: HwDeviceType::D3d11va,
            derived_dev_type: HwDeviceType::None,
            dev_pix_fmt: PixelFormat::D3d11,
            pix_fmt_8bit: PixelFormat::Nv12,
            pix_fmt_10bit: PixelFormat::P010,
            pix_fmt_yuv444_8bit: PixelFormat::None,
            pix_fmt_yuv444_10bit: PixelFormat::None,
            init_hw_device: Some(factory::init_dxgi_device),
        }),
        av1: CodecSupport {
            common_options: vec![
                EncoderOption::int("filler_data", 0),
                EncoderOption::int("forced_idr", 1),
                EncoderOption::str("latency", "lowest_latency"),
                EncoderOption::int("async_depth", 1),
                EncoderOption::int("skip_frame", 0),
                EncoderOption::settings("log_to_dbg", log_to_dbg),
                EncoderOption::settings("preencode", |s| s.amd.preanalysis as i64),
                EncoderOption::settings("quality", |s| s.amd.quality_av1 as i64),
                EncoderOption::settings("rc", |s| s.amd.rc_av1 as i64),
                EncoderOption::settings("usage", |s| s.amd.usage_av1 as i64),
                EncoderOption::settings("enforce_hrd", |s| s.amd.enforce_hrd as i64),
            ],
            ..CodecSupport::named("av1_amf")
        },
        hevc: CodecSupport {
            common_options: vec![
                EncoderOption::int("filler_data", 0),
                EncoderOption::int("forced_idr", 1),
                EncoderOption::int("latency", 1),
                EncoderOption::int("async_depth", 1),
                EncoderOption::int("skip_frame", 0),
                EncoderOption::settings("log_to_dbg", log_to_dbg),
                EncoderOption::int("gops_per_idr", 1),
                EncoderOption::str("header_insertion_mode", "idr"),
                EncoderOption::settings("preencode", |s| s.amd.preanalysis as i64),
                EncoderOption::settings("quality", |s| s.amd.quality_hevc as i64),
                EncoderOption::settings("rc", |s| s.amd.rc_hevc as i64),
                EncoderOption::settings("usage", |s| s.amd.usage_hevc as i64),
                EncoderOption::settings("vbaq", |s| s.amd.vbaq as i64),
                EncoderOption::settings("enforce_hrd", |s| s.amd.enforce_hrd as i64),
                EncoderOption::client_str("level", |cfg| {
                    let size = cfg.width as i64 * cfg.height as i64;
                    // For 4K and below, try level 5.1 or 5.2 when the pixel
                    // rate allows it
                    if size <= 8_912_896 {
                        if size * cfg.framerate as i64 <= 534_773_760 {
                            return "5.1".into();
                        } else if size * cfg.framerate as i64 <= 1_069_547_520 {
                            return "5.2".into();
                        }
                    }
                    "auto".into()
                }),
            ],
            ..CodecSupport::named("hevc_amf")
        },
        h264: CodecSupport {
            common_options: vec![
                EncoderOption::int("filler_data", 0),
                EncoderOption::int("forced_idr", 1),
                EncoderOption::int("latency", 1),
                EncoderOption::int("async_depth", 1),
                EncoderOption::int("frame_skipping", 0),
                EncoderOption::settings("log_to_dbg", log_to_dbg),
                EncoderOption::settings("preencode", |s| s.amd.preanalysis as i64),
                EncoderOption::settings("quality", |s| s.amd.quality_h264 as i64),
                EncoderOption::settings("rc", |s| s.amd.rc_h264 as i64),
                EncoderOption::settings("usage", |s| s.amd.usage_h264 as i64),
                EncoderOption::settings("vbaq", |s| s.amd.vbaq as i64),
                EncoderOption::settings("enforce_hrd", |s| s.amd.enforce_hrd as i64),
            ],
            // AMF usage LOW_LATENCY, working around a driver quirk with the
            // ultra-low-latency usage on some generations
            fallback_options: vec![EncoderOption::int("usage", 2)],
            ..CodecSupport::named("h264_amf")
        },
        flags: EncoderFlags::PARALLEL_ENCODING,
    }
}

/// CPU encoding via libx264 / libx265
pub fn software() -> EncoderDescriptor {
    EncoderDescriptor {
        name: "software",
        formats: PlatformFormats::Avcodec(AvcodecFormats {
            base_dev_type: HwDeviceType::None,
            derived_dev_type: HwDeviceType::None,
            dev_pix_fmt: PixelFormat::None,
            pix_fmt_8bit: PixelFormat::Yuv420p,
            pix_fmt_10bit: PixelFormat::Yuv420p10,
            pix_fmt_yuv444_8bit: PixelFormat::Yuv444p,
            pix_fmt_yuv444_10bit: PixelFormat::Yuv444p10,
            init_hw_device: None,
        }),
        // Due to bugs preventing on-demand IDR frames from working and very
        // poor real-time performance, libsvtav1 stays unregistered; the
        // option set is kept for when it becomes viable. An infinite GOP,
        // low delay prediction structure and forced key frames match the
        // x26x configuration.
        av1: CodecSupport {
            common_options: vec![
                EncoderOption::str(
                    "svtav1-params",
                    "keyint=-1:pred-struct=1:force-key-frames=1:mbr=0",
                ),
                EncoderOption::settings("preset", |s| s.sw.svtav1_preset as i64),
            ],
            ..CodecSupport::named("")
        },
        // x265's Info SEI is long enough to push the IDR picture data into
        // the second packet of the frame, which breaks client parsers, and
        // gop_size isn't passed through to x265, so keyint rides along in
        // x265-params.
        hevc: CodecSupport {
            common_options: vec![
                EncoderOption::int("forced-idr", 1),
                EncoderOption::str("x265-params", "info=0:keyint=-1"),
                EncoderOption::settings_str("preset", |s| s.sw.preset.clone()),
                EncoderOption::settings_str("tune", |s| s.sw.tune.clone()),
            ],
            ..CodecSupport::named("libx265")
        },
        h264: CodecSupport {
            common_options: vec![
                EncoderOption::settings_str("preset", |s| s.sw.preset.clone()),
                EncoderOption::settings_str("tune", |s| s.sw.tune.clone()),
            ],
            ..CodecSupport::named("libx264")
        },
        flags: EncoderFlags::H264_ONLY
            | EncoderFlags::PARALLEL_ENCODING
            | EncoderFlags::ALWAYS_REPROBE
            | EncoderFlags::YUV444_SUPPORT,
    }
}

/// VAAPI through avcodec (Linux)
pub fn vaapi() -> EncoderDescriptor {
    let common = |sei: bool| {
        let mut options = vec![EncoderOption::int("async_depth", 1)];
        if sei {
            options.push(EncoderOption::int("sei", 0));
        }
        options.push(EncoderOption::int("idr_interval", i32::MAX as i64));
        options
    };

    EncoderDescriptor {
        name: "vaapi",
        formats: PlatformFormats::Avcodec(AvcodecFormats {
            base_dev_type: HwDeviceType::Vaapi,
            derived_dev_type: HwDeviceType::None,
            dev_pix_fmt: PixelFormat::Vaapi,
            pix_fmt_8bit: PixelFormat::Nv12,
            pix_fmt_10bit: PixelFormat::P010,
            pix_fmt_yuv444_8bit: PixelFormat::None,
            pix_fmt_yuv444_10bit: PixelFormat::None,
            init_hw_device: Some(factory::init_vaapi_device),
        }),
        av1: CodecSupport {
            common_options: common(false),
            ..CodecSupport::named("av1_vaapi")
        },
        hevc: CodecSupport {
            common_options: common(true),
            ..CodecSupport::named("hevc_vaapi")
        },
        h264: CodecSupport {
            common_options: common(true),
            ..CodecSupport::named("h264_vaapi")
        },
        // RC buffer size is left to the driver where supported
        flags: EncoderFlags::LIMITED_GOP_SIZE
            | EncoderFlags::PARALLEL_ENCODING
            | EncoderFlags::NO_RC_BUF_LIMIT,
    }
}

/// VideoToolbox through avcodec (macOS)
pub fn videotoolbox() -> EncoderDescriptor {
    let common = || {
        vec![
            EncoderOption::settings("allow_sw", |s| s.vt.allow_sw as i64),
            EncoderOption::settings("require_sw", |s| s.vt.require_sw as i64),
            EncoderOption::settings("realtime", |s| s.vt.realtime as i64),
            EncoderOption::int("prio_speed", 1),
            EncoderOption::int("max_ref_frames", 1),
        ]
    };

    EncoderDescriptor {
        name: "videotoolbox",
        formats: PlatformFormats::Avcodec(AvcodecFormats {
            base_dev_type: HwDeviceType::VideoToolbox,
            derived_dev_type: HwDeviceType::None,
            dev_pix_fmt: PixelFormat::VideoToolbox,
            pix_fmt_8bit: PixelFormat::Nv12,
            pix_fmt_10bit: PixelFormat::P010,
            pix_fmt_yuv444_8bit: PixelFormat::None,
            pix_fmt_yuv444_10bit: PixelFormat::None,
            init_hw_device: Some(factory::init_videotoolbox_device),
        }),
        av1: CodecSupport {
            common_options: common(),
            ..CodecSupport::named("av1_videotoolbox")
        },
        hevc: CodecSupport {
            common_options: common(),
            ..CodecSupport::named("hevc_videotoolbox")
        },
        h264: CodecSupport {
            common_options: common(),
            fallback_options: vec![EncoderOption::str("flags", "-low_delay")],
            ..CodecSupport::named("h264_videotoolbox")
        },
        flags: EncoderFlags::empty(),
    }
}

/// The ordered encoder candidate list for this platform
pub struct Registry {
    pub encoders: Vec<EncoderDescriptor>,
}

impl Registry {
    pub fn platform_default() -> Self {
        let mut encoders = Vec::new();

        #[cfg(windows)]
        {
            encoders.push(nvenc_native());
            encoders.push(quicksync());
            encoders.push(amdvce());
        }
        #[cfg(all(not(windows), not(target_os = "macos")))]
        {
            encoders.push(nvenc_avcodec());
        }
        #[cfg(target_os = "linux")]
        {
            encoders.push(vaapi());
        }
        #[cfg(target_os = "macos")]
        {
            encoders.push(videotoolbox());
        }
        encoders.push(software());

        Self { encoders }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ends_with_software() {
        let registry = Registry::platform_default();
        assert!(!registry.encoders.is_empty());
        assert_eq!(registry.encoders.last().unwrap().name, "software");
    }

    #[test]
    fn test_software_descriptor_shape() {
        let sw = software();
        assert!(sw.flags.contains(EncoderFlags::H264_ONLY));
        assert!(sw.flags.contains(EncoderFlags::ALWAYS_REPROBE));
        assert_eq!(sw.h264.name, "libx264");
        assert_eq!(sw.hevc.name, "libx265");
        // The software AV1 encoder is not registered
        assert!(!sw.av1.available());
        assert!(matches!(sw.formats, PlatformFormats::Avcodec(ref f)
            if f.base_dev_type == HwDeviceType::None));
    }

    #[test]
    fn test_sw_pix_fmt_selection() {
        let sw = software();
        assert_eq!(sw.formats.sw_pix_fmt(8, false), PixelFormat::Yuv420p);
        assert_eq!(sw.formats.sw_pix_fmt(10, false), PixelFormat::Yuv420p10);
        assert_eq!(sw.formats.sw_pix_fmt(8, true), PixelFormat::Yuv444p);
        assert_eq!(sw.formats.sw_pix_fmt(10, true), PixelFormat::Yuv444p10);
    }

    #[test]
    fn test_capabilities_set_and_clear() {
        let mut caps = Capabilities::default();
        assert!(!caps.passed);
        caps.set_all();
        assert!(caps.passed && caps.yuv444 && caps.vui_parameters);
        caps.clear();
        assert_eq!(caps, Capabilities::default());
    }

    #[test]
    fn test_codec_support_lookup() {
        let qsv = quicksync();
        assert_eq!(qsv.codec_support(VideoFormat::H264).name, "h264_qsv");
        assert_eq!(qsv.codec_support(VideoFormat::Hevc).name, "hevc_qsv");
        assert_eq!(qsv.codec_support(VideoFormat::Av1).name, "av1_qsv");
    }
}
