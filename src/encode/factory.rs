//! Encode device and session construction
//!
//! Builds an encode session from (display, encoder descriptor, client
//! config, encode device): codec context setup, hardware frame pool,
//! software converter wiring, HDR side data and option application with a
//! single fallback retry.

use std::ffi::CString;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::frame;

use crate::capture::Display;
use crate::config::{ChromaSampling, ClientConfig, VideoFormat, VideoSettings};
use crate::encode::device::{AvcodecEncodeDevice, EncodeDevice, SoftwareEncodeDevice};
use crate::encode::options;
use crate::encode::session::{AvcodecSession, EncodeSession, InjectMode, NvencSession};
use crate::encode::{EncoderDescriptor, EncoderFlags, PlatformFormats};
use crate::error::{Error, Result};
use crate::types::{AvColorMapping, Colorspace, HwDeviceType, PixelFormat};

/// AVCodecContext::profile values (AV_PROFILE_*)
mod profiles {
    pub const H264_HIGH: i32 = 100;
    pub const H264_HIGH_444_PREDICTIVE: i32 = 244;
    pub const HEVC_MAIN: i32 = 1;
    pub const HEVC_MAIN_10: i32 = 2;
    pub const HEVC_REXT: i32 = 4;
    pub const AV1_MAIN: i32 = 0;
    pub const AV1_HIGH: i32 = 1;
}

/// Owned AVBufferRef (hwdevice or hwframe context)
pub struct AvBuffer(*mut ffi::AVBufferRef);

impl AvBuffer {
    fn as_mut_ptr(&mut self) -> *mut ffi::AVBufferRef {
        self.0
    }
}

impl Drop for AvBuffer {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.0);
        }
    }
}

/// Creates the base hwdevice context for one encoder family
pub type InitHwDeviceFn = fn(&mut dyn AvcodecEncodeDevice, &VideoSettings) -> Result<AvBuffer>;

fn av_err(status: i32) -> String {
    ffmpeg::Error::from(status).to_string()
}

/// CUDA hwdevice bound to the primary context
pub fn init_cuda_device(
    _device: &mut dyn AvcodecEncodeDevice,
    _settings: &VideoSettings,
) -> Result<AvBuffer> {
    let mut buf: *mut ffi::AVBufferRef = std::ptr::null_mut();
    // AV_CUDA_USE_PRIMARY_CONTEXT
    let status = unsafe {
        ffi::av_hwdevice_ctx_create(
            &mut buf,
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            std::ptr::null(),
            std::ptr::null_mut(),
            1,
        )
    };
    if status < 0 {
        return Err(Error::EncoderInit(format!(
            "failed to create a CUDA device: {}",
            av_err(status)
        )));
    }
    Ok(AvBuffer(buf))
}

/// VAAPI hwdevice on the configured render node
pub fn init_vaapi_device(
    _device: &mut dyn AvcodecEncodeDevice,
    settings: &VideoSettings,
) -> Result<AvBuffer> {
    let render_device = (!settings.adapter_name.is_empty())
        .then(|| CString::new(settings.adapter_name.clone()).ok())
        .flatten();

    let mut buf: *mut ffi::AVBufferRef = std::ptr::null_mut();
    let status = unsafe {
        ffi::av_hwdevice_ctx_create(
            &mut buf,
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            render_device
                .as_ref()
                .map(|name| name.as_ptr())
                .unwrap_or(std::ptr::null()),
            std::ptr::null_mut(),
            0,
        )
    };
    if status < 0 {
        return Err(Error::EncoderInit(format!(
            "failed to create a VAAPI device: {}",
            av_err(status)
        )));
    }
    Ok(AvBuffer(buf))
}

/// VideoToolbox hwdevice
pub fn init_videotoolbox_device(
    _device: &mut dyn AvcodecEncodeDevice,
    _settings: &VideoSettings,
) -> Result<AvBuffer> {
    let mut buf: *mut ffi::AVBufferRef = std::ptr::null_mut();
    let status = unsafe {
        ffi::av_hwdevice_ctx_create(
            &mut buf,
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
            std::ptr::null(),
            std::ptr::null_mut(),
            0,
        )
    };
    if status < 0 {
        return Err(Error::EncoderInit(format!(
            "failed to create a VideoToolbox device: {}",
            av_err(status)
        )));
    }
    Ok(AvBuffer(buf))
}

/// D3D11VA hwdevice wrapping the capture device's native D3D11 device
pub fn init_dxgi_device(
    device: &mut dyn AvcodecEncodeDevice,
    _settings: &VideoSettings,
) -> Result<AvBuffer> {
    #[cfg(windows)]
    {
        unsafe extern "C" fn do_nothing(_ctx: *mut std::ffi::c_void) {}

        let native = device.native_device().ok_or_else(|| {
            Error::EncoderInit("capture device exposes no D3D11 device".into())
        })?;
        unsafe {
            let buf = ffi::av_hwdevice_ctx_alloc(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA);
            if buf.is_null() {
                return Err(Error::EncoderInit("failed to allocate D3D11VA context".into()));
            }
            let mut buf = AvBuffer(buf);
            let dev_ctx = (*buf.0).data as *mut ffi::AVHWDeviceContext;
            let d3d11 = (*dev_ctx).hwctx as *mut ffi::AVD3D11VADeviceContext;
            std::ptr::write_bytes(d3d11 as *mut u8, 0, std::mem::size_of::<ffi::AVD3D11VADeviceContext>());
            (*d3d11).device = native as *mut _;
            (*d3d11).lock_ctx = 1 as *mut std::ffi::c_void;
            (*d3d11).lock = Some(do_nothing);
            (*d3d11).unlock = Some(do_nothing);

            let status = ffi::av_hwdevice_ctx_init(buf.as_mut_ptr());
            if status < 0 {
                return Err(Error::EncoderInit(format!(
                    "failed to create hardware device context: {}",
                    av_err(status)
                )));
            }
            Ok(buf)
        }
    }
    #[cfg(not(windows))]
    {
        let _ = device;
        Err(Error::EncoderInit(
            "D3D11VA encoding is only available on Windows".into(),
        ))
    }
}

/// Build the encode device for a display/encoder/config triple
pub fn make_encode_device(
    disp: &dyn Display,
    encoder: &EncoderDescriptor,
    config: &ClientConfig,
) -> Result<EncodeDevice> {
    let colorspace = Colorspace::from_client_config(config, disp.is_hdr());

    let yuv444 = config.chroma_sampling == ChromaSampling::Cs444;
    if yuv444 && !encoder.flags.contains(EncoderFlags::YUV444_SUPPORT) {
        // Encoder can't support YUV 4:4:4 regardless of hardware capabilities
        return Err(Error::CodecNotSupported(format!(
            "{} does not support YUV 4:4:4",
            encoder.name
        )));
    }
    let pix_fmt = encoder.formats.sw_pix_fmt(colorspace.bit_depth, yuv444);

    tracing::info!(
        encoder = encoder.codec_support(config.video_format).name,
        "creating encoder"
    );
    tracing::info!("color coding: {}", colorspace.describe());
    tracing::info!("color depth: {}-bit", colorspace.bit_depth);
    tracing::info!(
        "color range: {}",
        if colorspace.full_range { "JPEG" } else { "MPEG" }
    );

    let mut device = match &encoder.formats {
        PlatformFormats::Avcodec(_) => {
            EncodeDevice::Avcodec(disp.make_avcodec_encode_device(pix_fmt)?)
        }
        PlatformFormats::Nvenc(_) => EncodeDevice::Nvenc(disp.make_nvenc_encode_device(pix_fmt)?),
    };
    match &mut device {
        EncodeDevice::Avcodec(dev) => dev.set_colorspace(colorspace),
        EncodeDevice::Nvenc(dev) => dev.set_colorspace(colorspace),
    }
    Ok(device)
}

/// Build the encode session for a prepared encode device.
/// `width`/`height` are the capture dimensions feeding the converter.
pub fn make_encode_session(
    disp: &dyn Display,
    encoder: &EncoderDescriptor,
    settings: &VideoSettings,
    config: &ClientConfig,
    width: u32,
    height: u32,
    device: EncodeDevice,
) -> Result<EncodeSession> {
    match device {
        EncodeDevice::Avcodec(device) => {
            make_avcodec_session(disp, encoder, settings, config, width, height, device)
        }
        EncodeDevice::Nvenc(device) => make_nvenc_session(config, device),
    }
}

fn make_nvenc_session(
    config: &ClientConfig,
    mut device: Box<dyn crate::encode::NvencEncodeDevice>,
) -> Result<EncodeSession> {
    let colorspace = device.colorspace();
    device.init_encoder(config, colorspace)?;
    Ok(EncodeSession::Nvenc(NvencSession::new(
        device,
        config.display_index,
    )))
}

fn profile_for(config: &ClientConfig) -> i32 {
    let yuv444 = config.chroma_sampling == ChromaSampling::Cs444;
    match config.video_format {
        // 10-bit H.264 is rejected at config validation
        VideoFormat::H264 => {
            if yuv444 {
                profiles::H264_HIGH_444_PREDICTIVE
            } else {
                profiles::H264_HIGH
            }
        }
        VideoFormat::Hevc => {
            if yuv444 {
                // The same RExt profile covers 8 and 10 bit YUV 4:4:4
                profiles::HEVC_REXT
            } else if config.dynamic_range {
                profiles::HEVC_MAIN_10
            } else {
                profiles::HEVC_MAIN
            }
        }
        // AV1 keeps Main for 8 and 10 bit, but 4:4:4 needs High
        VideoFormat::Av1 => {
            if yuv444 {
                profiles::AV1_HIGH
            } else {
                profiles::AV1_MAIN
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn make_avcodec_session(
    disp: &dyn Display,
    encoder: &EncoderDescriptor,
    settings: &VideoSettings,
    config: &ClientConfig,
    width: u32,
    height: u32,
    mut device: Box<dyn AvcodecEncodeDevice>,
) -> Result<EncodeSession> {
    ffmpeg::init().map_err(|e| Error::Ffmpeg(e.to_string()))?;

    let formats = match &encoder.formats {
        PlatformFormats::Avcodec(formats) => formats,
        PlatformFormats::Nvenc(_) => {
            return Err(Error::EncoderInit(
                "native NVENC descriptor cannot build an avcodec session".into(),
            ))
        }
    };
    let hardware = formats.base_dev_type != HwDeviceType::None;

    let support = encoder.codec_support(config.video_format);
    if !support.caps.passed || !disp.is_codec_supported(support.name, config) {
        tracing::error!("{}: {} mode not supported", encoder.name, support.name);
        return Err(Error::CodecNotSupported(support.name.into()));
    }
    if config.dynamic_range && !support.caps.dynamic_range {
        tracing::error!("{}: dynamic range not supported", support.name);
        return Err(Error::CodecNotSupported(support.name.into()));
    }
    let yuv444 = config.chroma_sampling == ChromaSampling::Cs444;
    if yuv444 && !support.caps.yuv444 {
        tracing::error!("{}: YUV 4:4:4 not supported", support.name);
        return Err(Error::CodecNotSupported(support.name.into()));
    }

    let colorspace = device.colorspace();
    let sw_fmt = formats.sw_pix_fmt(colorspace.bit_depth, yuv444);
    if sw_fmt == PixelFormat::None {
        return Err(Error::CodecNotSupported(format!(
            "{}: no pixel format for {}-bit{}",
            encoder.name,
            colorspace.bit_depth,
            if yuv444 { " YUV 4:4:4" } else { "" }
        )));
    }
    let mapping = AvColorMapping::from(colorspace);

    // Allow up to 1 retry to apply the set of fallback options
    for retries in 0..2 {
        let codec = ffmpeg::encoder::find_by_name(support.name)
            .ok_or_else(|| Error::CodecNotSupported(format!("couldn't open [{}]", support.name)))?;
        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec);

        let (num, den) = config.framerate_rational();
        unsafe {
            let raw = ctx.as_mut_ptr();
            (*raw).width = config.width;
            (*raw).height = config.height;
            (*raw).time_base = ffi::AVRational { num: den, den: num };
            (*raw).framerate = ffi::AVRational { num, den };
        }

        let mut slices = if hardware {
            config.slices_per_frame
        } else {
            // Clients ask for the fewest slices for decode efficiency, but
            // software encoding needs enough slices for parallelism
            config.slices_per_frame.max(settings.min_threads)
        };
        if encoder.flags.contains(EncoderFlags::SINGLE_SLICE_ONLY) {
            slices = 1;
        }

        let bitrate = settings.effective_bitrate(config.bitrate_kbps);
        tracing::info!("streaming bitrate is {}", bitrate);

        unsafe {
            let raw = ctx.as_mut_ptr();

            (*raw).profile = profile_for(config);

            // B-frames delay decoder output, so never use them
            (*raw).max_b_frames = 0;

            // I-frames are generated on demand, so the GOP is as long as the
            // codec allows
            (*raw).gop_size = if encoder.flags.contains(EncoderFlags::LIMITED_GOP_SIZE) {
                i16::MAX as i32
            } else {
                i32::MAX
            };
            (*raw).keyint_min = i32::MAX;

            // Some client decoders have limits on the number of reference frames
            if config.num_ref_frames > 0 {
                if support.caps.ref_frames_restrict {
                    (*raw).refs = config.num_ref_frames;
                } else {
                    tracing::warn!(
                        "client requested a reference frame limit, but the encoder doesn't support it"
                    );
                }
            }

            (*raw).flags = (ffi::AV_CODEC_FLAG_CLOSED_GOP | ffi::AV_CODEC_FLAG_LOW_DELAY) as i32;
            (*raw).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;

            (*raw).color_range = mapping.range.into();
            (*raw).color_primaries = mapping.primaries.into();
            (*raw).color_trc = mapping.transfer.into();
            (*raw).colorspace = mapping.matrix.into();

            // Used by the SPS rewriter
            (*raw).sw_pix_fmt = sw_fmt.to_av().into();

            (*raw).slices = slices;
            (*raw).thread_type = ffi::FF_THREAD_SLICE as i32;
            (*raw).thread_count = slices;

            (*raw).rc_max_rate = bitrate;
            (*raw).bit_rate = bitrate;
            if encoder.flags.contains(EncoderFlags::CBR_WITH_VBR) {
                // Ensure rc_max_rate != bit_rate to force VBR mode
                (*raw).bit_rate -= 1;
            } else {
                (*raw).rc_min_rate = bitrate;
            }
            if encoder.flags.contains(EncoderFlags::RELAXED_COMPLIANCE) {
                (*raw).strict_std_compliance = ffi::FF_COMPLIANCE_UNOFFICIAL;
            }

            if !encoder.flags.contains(EncoderFlags::NO_RC_BUF_LIMIT) {
                let fps = config.framerate.max(1) as i64;
                if !hardware && (slices > 1 || config.video_format == VideoFormat::Hevc) {
                    // Small VBV buffers severely degrade software encode
                    // quality once slicing is enabled; HEVC hits this even
                    // with a single slice, so scale the buffer by 1.5x
                    (*raw).rc_buffer_size = (bitrate / ((fps * 10) / 15)) as i32;
                } else {
                    let mut size = bitrate / fps;
                    if encoder.name == "nvenc" && settings.nv.vbv_percentage_increase > 0 {
                        size += size * settings.nv.vbv_percentage_increase as i64 / 100;
                    }
                    (*raw).rc_buffer_size = size as i32;
                }
            }
        }

        // Hardware frame wiring
        let mut frames_ctx_raw: *mut ffi::AVHWFramesContext = std::ptr::null_mut();
        let mut _frames_ref = None;
        if hardware {
            unsafe {
                (*ctx.as_mut_ptr()).pix_fmt = formats.dev_pix_fmt.to_av().into();
            }

            let init_fn = formats.init_hw_device.ok_or_else(|| {
                Error::EncoderInit(format!("{}: missing hwdevice constructor", encoder.name))
            })?;
            let mut device_ctx = init_fn(device.as_mut(), settings)?;

            // Derive the desired device type from the base when declared
            if formats.derived_dev_type != HwDeviceType::None {
                device.prepare_to_derive_context(formats.derived_dev_type)?;
                let mut derived: *mut ffi::AVBufferRef = std::ptr::null_mut();
                let status = unsafe {
                    ffi::av_hwdevice_ctx_create_derived(
                        &mut derived,
                        formats.derived_dev_type.to_av(),
                        device_ctx.as_mut_ptr(),
                        0,
                    )
                };
                if status < 0 {
                    tracing::error!("failed to derive device context: {}", av_err(status));
                    return Err(Error::EncoderInit("hwdevice derivation failed".into()));
                }
                device_ctx = AvBuffer(derived);
            }

            let frames_ref = unsafe { ffi::av_hwframe_ctx_alloc(device_ctx.as_mut_ptr()) };
            if frames_ref.is_null() {
                return Err(Error::EncoderInit("failed to allocate hwframe context".into()));
            }
            let mut frames_ref = AvBuffer(frames_ref);
            unsafe {
                let frames_ctx = (*frames_ref.as_mut_ptr()).data as *mut ffi::AVHWFramesContext;
                (*frames_ctx).format = formats.dev_pix_fmt.to_av().into();
                (*frames_ctx).sw_format = sw_fmt.to_av().into();
                (*frames_ctx).width = config.width;
                (*frames_ctx).height = config.height;
                (*frames_ctx).initial_pool_size = 0;

                // Let the hwdevice adjust pool parameters before init
                device.init_hwframes(frames_ctx)?;

                let status = ffi::av_hwframe_ctx_init(frames_ref.as_mut_ptr());
                if status < 0 {
                    return Err(Error::EncoderInit(format!(
                        "failed to initialize hwframe context: {}",
                        av_err(status)
                    )));
                }

                (*ctx.as_mut_ptr()).hw_frames_ctx = ffi::av_buffer_ref(frames_ref.as_mut_ptr());
                frames_ctx_raw = frames_ctx;
            }
            _frames_ref = Some((device_ctx, frames_ref));
        } else {
            unsafe {
                (*ctx.as_mut_ptr()).pix_fmt = sw_fmt.to_av().into();
            }
        }

        let mut dict = options::build_options(support, settings, config, retries > 0);
        // Final opportunity for the device to override options
        let ctx_ptr = unsafe { ctx.as_mut_ptr() };
        device.init_codec_options(ctx_ptr, &mut dict);

        // The context was allocated for this codec, so avcodec_open2 does
        // not need it again
        let mut dict_ptr = dict.disown();
        let status =
            unsafe { ffi::avcodec_open2(ctx.as_mut_ptr(), std::ptr::null(), &mut dict_ptr) };
        unsafe {
            ffi::av_dict_free(&mut dict_ptr);
        }
        if status < 0 {
            if !support.fallback_options.is_empty() && retries == 0 {
                tracing::info!(
                    "retrying with fallback configuration options for [{}] after error: {}",
                    support.name,
                    av_err(status)
                );
                continue;
            }
            tracing::error!("could not open codec [{}]: {}", support.name, av_err(status));
            return Err(Error::EncoderInit(format!(
                "could not open codec [{}]: {}",
                support.name,
                av_err(status)
            )));
        }

        // The encoder frame, matching the opened context
        let mut frame = if hardware {
            let mut frame = frame::Video::empty();
            unsafe {
                let raw = frame.as_mut_ptr();
                (*raw).width = config.width;
                (*raw).height = config.height;
                let dev_fmt: ffi::AVPixelFormat = formats.dev_pix_fmt.to_av().into();
                (*raw).format = dev_fmt as i32;
            }
            frame
        } else {
            frame::Video::new(sw_fmt.to_av(), config.width as u32, config.height as u32)
        };
        unsafe {
            let raw = frame.as_mut_ptr();
            (*raw).color_range = mapping.range.into();
            (*raw).color_primaries = mapping.primaries.into();
            (*raw).color_trc = mapping.transfer.into();
            (*raw).colorspace = mapping.matrix.into();
            (*raw).chroma_location = (*ctx.as_ptr()).chroma_sample_location;
        }

        if colorspace.is_hdr() {
            match disp.hdr_metadata() {
                Some(metadata) => unsafe {
                    attach_hdr_side_data(&mut frame, &metadata);
                },
                None => {
                    tracing::error!(
                        "couldn't get display hdr metadata when colorspace selection indicates it should have one"
                    );
                }
            }
        }

        // Captured images in system memory go through the CPU converter
        let mut device_final: Box<dyn AvcodecEncodeDevice> = if device.native_device().is_none() {
            Box::new(SoftwareEncodeDevice::new(
                width,
                height,
                config.width as u32,
                config.height as u32,
                sw_fmt,
                hardware,
                colorspace,
            )?)
        } else {
            device
        };

        let hw_frames_for_frame = (!frames_ctx_raw.is_null())
            .then(|| unsafe { (*ctx.as_ptr()).hw_frames_ctx })
            .filter(|ptr| !ptr.is_null());
        device_final.set_frame(frame, hw_frames_for_frame)?;
        device_final.apply_colorspace();

        let inject = match config.video_format {
            VideoFormat::H264 if !support.caps.vui_parameters => InjectMode::H264Sps,
            VideoFormat::Hevc if !support.caps.vui_parameters => InjectMode::HevcSpsVps,
            _ => InjectMode::Off,
        };

        return Ok(EncodeSession::Avcodec(AvcodecSession::new(
            ctx,
            device_final,
            inject,
            config.display_index,
        )));
    }

    Err(Error::EncoderInit(format!(
        "could not configure [{}]",
        support.name
    )))
}

unsafe fn attach_hdr_side_data(frame: &mut frame::Video, metadata: &crate::types::HdrMetadata) {
    let mdm = ffi::av_mastering_display_metadata_create_side_data(frame.as_mut_ptr());
    if mdm.is_null() {
        return;
    }

    for (i, primary) in metadata.display_primaries.iter().enumerate() {
        (*mdm).display_primaries[i][0] = ffi::AVRational {
            num: primary.x as i32,
            den: 50000,
        };
        (*mdm).display_primaries[i][1] = ffi::AVRational {
            num: primary.y as i32,
            den: 50000,
        };
    }
    (*mdm).white_point[0] = ffi::AVRational {
        num: metadata.white_point.x as i32,
        den: 50000,
    };
    (*mdm).white_point[1] = ffi::AVRational {
        num: metadata.white_point.y as i32,
        den: 50000,
    };
    (*mdm).min_luminance = ffi::AVRational {
        num: metadata.min_display_luminance as i32,
        den: 10000,
    };
    (*mdm).max_luminance = ffi::AVRational {
        num: metadata.max_display_luminance as i32,
        den: 1,
    };
    (*mdm).has_luminance = i32::from(metadata.max_display_luminance != 0);
    (*mdm).has_primaries = i32::from(metadata.display_primaries[0].x != 0);

    if metadata.max_content_light_level != 0 || metadata.max_frame_average_light_level != 0 {
        let clm = ffi::av_content_light_metadata_create_side_data(frame.as_mut_ptr());
        if !clm.is_null() {
            (*clm).MaxCLL = metadata.max_content_light_level as u32;
            (*clm).MaxFALL = metadata.max_frame_average_light_level as u32;
        }
    }
}
