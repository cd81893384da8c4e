//! Encoder probing and selection
//!
//! Drives trial encode sessions against the current display to fill each
//! encoder's capability matrix, then selects a single active encoder for
//! the process. Probing runs single-threaded before the first capture
//! session; the resulting descriptor is frozen behind an `Arc`.

use std::sync::Arc;

use crate::capture::{Display, DisplayBackend};
use crate::config::{ChromaSampling, ClientConfig, VideoFormat, VideoSettings};
use crate::control;
use crate::encode::session::EncodeSession;
use crate::encode::{factory, EncoderDescriptor, EncoderFlags, Registry};
use crate::error::{Error, Result};
use crate::events::EventQueue;

/// `validate_config` result bit: the emitted SPS carries VUI parameters
const VUI_PARAMS: u8 = 0x01;

/// Everything downstream needs to know about the probe decision
#[derive(Clone)]
pub struct ProbeOutcome {
    pub encoder: Arc<EncoderDescriptor>,
    /// Finalized HEVC mode (1 = disabled, 2 = supported, 3 = with HDR)
    pub hevc_mode: i32,
    /// Finalized AV1 mode
    pub av1_mode: i32,
    /// The active encoder can invalidate reference frames natively
    pub ref_frames_invalidation: bool,
    /// Per-codec YUV 4:4:4 support (H.264, HEVC, AV1)
    pub yuv444: [bool; 3],
}

/// Probe pre-check: refuse only when the OS reports devices but none of
/// them is active, which is known to wedge capture APIs.
fn allow_encoder_probing(backend: &dyn DisplayBackend) -> bool {
    let devices = backend.enumerate_devices();
    // No devices means the enumeration API may simply be unsupported here
    if devices.is_empty() {
        return true;
    }
    if devices.iter().any(|device| device.active) {
        return true;
    }
    tracing::error!("no display devices are active at the moment, cannot probe the encoders");
    false
}

fn probe_config(num_ref_frames: i32) -> ClientConfig {
    ClientConfig {
        width: 1920,
        height: 1080,
        framerate: 60,
        framerate_x100: None,
        bitrate_kbps: 1000,
        slices_per_frame: 1,
        num_ref_frames,
        encoder_csc_mode: 1,
        video_format: VideoFormat::H264,
        dynamic_range: false,
        chroma_sampling: ChromaSampling::Cs420,
        display_index: 0,
    }
}

fn hdr_probe_config() -> ClientConfig {
    ClientConfig {
        encoder_csc_mode: 3,
        video_format: VideoFormat::Hevc,
        dynamic_range: true,
        ..probe_config(0)
    }
}

/// Single-frame trial encode: build a device and session, convert a dummy
/// image, request an IDR and encode until a packet appears. The first
/// packet must be an IDR; for avcodec H.264/HEVC the SPS is checked for
/// VUI parameters.
fn validate_config(
    disp: &Arc<dyn Display>,
    encoder: &EncoderDescriptor,
    settings: &VideoSettings,
    config: &ClientConfig,
) -> Result<u8> {
    let device = factory::make_encode_device(disp.as_ref(), encoder, config)?;
    let mut session = factory::make_encode_session(
        disp.as_ref(),
        encoder,
        settings,
        config,
        disp.width(),
        disp.height(),
        device,
    )?;

    {
        // Image buffers are large; free this one right after convert()
        let img = disp.alloc_img()?;
        disp.dummy_img(&img)?;
        let guard = img
            .lock()
            .map_err(|_| Error::Capture("poisoned image".into()))?;
        session.convert(&guard)?;
    }

    session.request_idr_frame();

    let packets = EventQueue::unbounded();
    let mut attempts = 0;
    while !packets.peek() {
        attempts += 1;
        if attempts > 1024 {
            return Err(Error::Probe("encoder produced no packet".into()));
        }
        session.encode(1, &packets, None, None)?;
    }

    let packet = packets.pop().expect("peeked above");
    if !packet.idr {
        tracing::error!("first packet type is not an IDR frame");
        return Err(Error::Probe("first packet was not an IDR".into()));
    }

    let mut flags = 0u8;
    // The VUI check only applies to H.264 and HEVC
    if config.video_format != VideoFormat::Av1 {
        if matches!(session, EncodeSession::Avcodec(_)) {
            if crate::cbs::validate_sps(&packet.data, config.video_format) {
                flags |= VUI_PARAMS;
            }
        } else {
            // Non-avcodec encoders produce conformant headers
            flags |= VUI_PARAMS;
        }
    }

    Ok(flags)
}

fn vui_bit(flags: Option<u8>) -> bool {
    // A skipped probe doesn't veto the VUI capability
    flags.map_or(true, |f| f & VUI_PARAMS != 0)
}

/// Populate one encoder's capability matrix. Returns false when the
/// encoder is unusable and should be dropped from the candidate list.
pub(crate) fn validate_encoder(
    backend: &dyn DisplayBackend,
    encoder: &mut EncoderDescriptor,
    settings: &VideoSettings,
    active_hevc_mode: i32,
    active_av1_mode: i32,
    expect_failure: bool,
) -> bool {
    tracing::info!("trying encoder [{}]", encoder.name);
    let failed = |encoder: &EncoderDescriptor| {
        tracing::info!("encoder [{}] failed", encoder.name);
        false
    };

    let mem_type = encoder.formats.mem_type();
    let flags = encoder.flags;
    let h264_only = flags.contains(EncoderFlags::H264_ONLY);
    let test_hevc = encoder.hevc.available()
        && (active_hevc_mode >= 2 || (active_hevc_mode == 0 && !h264_only));
    let test_av1 =
        encoder.av1.available() && (active_av1_mode >= 2 || (active_av1_mode == 0 && !h264_only));

    encoder.h264.caps.set_all();
    encoder.hevc.caps.set_all();
    encoder.av1.caps.set_all();

    let config_max_ref_frames = probe_config(1);
    let config_autoselect = probe_config(0);

    // If the encoder isn't supported at all (not even H.264), bail early
    let Some(disp) = control::reset_display(
        backend,
        mem_type,
        &settings.output_name,
        &config_autoselect,
    ) else {
        return failed(encoder);
    };
    if !disp.is_codec_supported(encoder.h264.name, &config_autoselect) {
        tracing::info!("encoder [{}] is not supported on this GPU", encoder.name);
        return false;
    }

    // When we expect failure, probe the autoselect config first since it
    // always succeeds on a working encoder; this eliminates broken
    // encoders with one trial instead of two.
    let mut max_ref_frames_h264 = if expect_failure {
        None
    } else {
        validate_config(&disp, encoder, settings, &config_max_ref_frames).ok()
    };
    let autoselect_h264 = match max_ref_frames_h264 {
        Some(flags) => Some(flags),
        None => validate_config(&disp, encoder, settings, &config_autoselect).ok(),
    };
    let Some(autoselect_h264) = autoselect_h264 else {
        return failed(encoder);
    };
    if expect_failure && max_ref_frames_h264.is_none() {
        // We expected failure but succeeded; run the skipped ref-limit probe
        max_ref_frames_h264 =
            validate_config(&disp, encoder, settings, &config_max_ref_frames).ok();
    }

    encoder.h264.caps.vui_parameters =
        vui_bit(max_ref_frames_h264) && (autoselect_h264 & VUI_PARAMS != 0);
    encoder.h264.caps.ref_frames_restrict = max_ref_frames_h264.is_some();
    encoder.h264.caps.passed = true;

    let h264_ref_limit_ok = max_ref_frames_h264.is_some();
    for format in [VideoFormat::Hevc, VideoFormat::Av1] {
        let tested = match format {
            VideoFormat::Hevc => test_hevc,
            _ => test_av1,
        };
        let name = encoder.codec_support(format).name;

        let mut cfg_max_ref = config_max_ref_frames.clone();
        cfg_max_ref.video_format = format;
        let mut cfg_autoselect = config_autoselect.clone();
        cfg_autoselect.video_format = format;

        if !tested {
            encoder.codec_support_mut(format).caps.clear();
            continue;
        }
        if !disp.is_codec_supported(name, &cfg_autoselect) {
            tracing::info!("encoder [{}] is not supported on this GPU", name);
            encoder.codec_support_mut(format).caps.clear();
            continue;
        }

        let max_ref_frames = validate_config(&disp, encoder, settings, &cfg_max_ref).ok();
        // If H.264 worked with the ref limit, this codec is expected to as
        // well when it works at all, so the autoselect probe is skipped
        let autoselect = if max_ref_frames.is_some() || h264_ref_limit_ok {
            max_ref_frames
        } else {
            validate_config(&disp, encoder, settings, &cfg_autoselect).ok()
        };

        let caps = &mut encoder.codec_support_mut(format).caps;
        caps.vui_parameters = vui_bit(max_ref_frames) && vui_bit(autoselect);
        caps.ref_frames_restrict = max_ref_frames.is_some();
        caps.passed = max_ref_frames.is_some() || autoselect.is_some();
    }

    // HDR and YUV 4:4:4 suite.
    // H.264 is special: encoders may support YUV 4:4:4 without 10-bit
    // color, and H.264 never advertises HDR.
    if flags.contains(EncoderFlags::YUV444_SUPPORT) {
        let mut cfg = probe_config(0);
        cfg.chroma_sampling = ChromaSampling::Cs444;
        encoder.h264.caps.yuv444 = disp.is_codec_supported(encoder.h264.name, &cfg)
            && validate_config(&disp, encoder, settings, &cfg).is_ok();
    } else {
        encoder.h264.caps.yuv444 = false;
    }
    encoder.h264.caps.dynamic_range = false;

    // Switching from SDR to HDR needs a fresh display
    let generic_hdr_config = hdr_probe_config();
    let Some(disp) = control::reset_display(
        backend,
        mem_type,
        &settings.output_name,
        &generic_hdr_config,
    ) else {
        return failed(encoder);
    };

    for format in [VideoFormat::Hevc, VideoFormat::Av1] {
        if !encoder.codec_support(format).caps.passed {
            continue;
        }
        let name = encoder.codec_support(format).name;
        let mut cfg = generic_hdr_config.clone();
        cfg.video_format = format;

        // Try 4:4:4 HDR first; when it passes, 4:2:0 is implied
        cfg.chroma_sampling = ChromaSampling::Cs444;
        if flags.contains(EncoderFlags::YUV444_SUPPORT)
            && disp.is_codec_supported(name, &cfg)
            && validate_config(&disp, encoder, settings, &cfg).is_ok()
        {
            let caps = &mut encoder.codec_support_mut(format).caps;
            caps.dynamic_range = true;
            caps.yuv444 = true;
            continue;
        }
        encoder.codec_support_mut(format).caps.yuv444 = false;

        cfg.chroma_sampling = ChromaSampling::Cs420;
        let dynamic_range = disp.is_codec_supported(name, &cfg)
            && validate_config(&disp, encoder, settings, &cfg).is_ok();
        encoder.codec_support_mut(format).caps.dynamic_range = dynamic_range;
    }

    if settings.force_video_header_replace {
        // Keep the header rewriter active even for conformant encoders
        encoder.h264.caps.vui_parameters = false;
        encoder.hevc.caps.vui_parameters = false;
    }
    if !encoder.h264.caps.vui_parameters {
        tracing::warn!("{}: h264 missing sps->vui parameters", encoder.name);
    }
    if encoder.hevc.caps.passed && !encoder.hevc.caps.vui_parameters {
        tracing::warn!("{}: hevc missing sps->vui parameters", encoder.name);
    }

    true
}

fn dump_capabilities(encoder: &EncoderDescriptor, format: VideoFormat) {
    let support = encoder.codec_support(format);
    tracing::debug!(
        codec = support.name,
        passed = support.caps.passed,
        ref_frames_restrict = support.caps.ref_frames_restrict,
        dynamic_range = support.caps.dynamic_range,
        yuv444 = support.caps.yuv444,
        vui_parameters = support.caps.vui_parameters,
        "probed capabilities"
    );
}

/// If the encoder can't satisfy both the preferred-encoder and codec
/// requirements, prefer the encoder and relax the codec mode.
fn adjust_encoder_constraints(
    encoder: &EncoderDescriptor,
    active_hevc_mode: &mut i32,
    active_av1_mode: &mut i32,
) {
    if *active_hevc_mode == 3 && !encoder.hevc.caps.dynamic_range {
        tracing::warn!(
            "encoder [{}] does not support HEVC Main10 on this system",
            encoder.name
        );
        *active_hevc_mode = 0;
    } else if *active_hevc_mode == 2 && !encoder.hevc.caps.passed {
        tracing::warn!(
            "encoder [{}] does not support HEVC on this system",
            encoder.name
        );
        *active_hevc_mode = 0;
    }

    if *active_av1_mode == 3 && !encoder.av1.caps.dynamic_range {
        tracing::warn!(
            "encoder [{}] does not support AV1 Main10 on this system",
            encoder.name
        );
        *active_av1_mode = 0;
    } else if *active_av1_mode == 2 && !encoder.av1.caps.passed {
        tracing::warn!(
            "encoder [{}] does not support AV1 on this system",
            encoder.name
        );
        *active_av1_mode = 0;
    }
}

/// Probe the registry and select the active encoder.
///
/// Passing the previous outcome enables the reprobe short-circuit: the old
/// selection is kept unless it demands reprobing or the OS device set
/// changed.
pub fn probe_encoders(
    backend: &Arc<dyn DisplayBackend>,
    registry: Registry,
    settings: &VideoSettings,
    previous: Option<&ProbeOutcome>,
) -> Result<ProbeOutcome> {
    if !allow_encoder_probing(backend.as_ref()) {
        return Err(Error::Probe("no active display devices".into()));
    }

    if let Some(previous_outcome) = previous {
        if !previous_outcome
            .encoder
            .flags
            .contains(EncoderFlags::ALWAYS_REPROBE)
            && !backend.needs_reenumeration()
        {
            return Ok(previous_outcome.clone());
        }
    }

    let mut encoder_list = registry.encoders;
    let mut active_hevc_mode = settings.hevc_mode;
    let mut active_av1_mode = settings.av1_mode;
    let previous_name = previous.map(|p| p.encoder.name);
    let expect_failure_for =
        |encoder: &EncoderDescriptor| previous_name.is_some_and(|name| name != encoder.name);

    let mut chosen: Option<EncoderDescriptor> = None;

    // A specifically requested encoder is used if it passes validation,
    // even when it misses codec requirements
    if !settings.encoder.is_empty() {
        if let Some(pos) = encoder_list
            .iter()
            .position(|encoder| encoder.name == settings.encoder)
        {
            let expect_failure = expect_failure_for(&encoder_list[pos]);
            if validate_encoder(
                backend.as_ref(),
                &mut encoder_list[pos],
                settings,
                active_hevc_mode,
                active_av1_mode,
                expect_failure,
            ) {
                let encoder = encoder_list.remove(pos);
                adjust_encoder_constraints(&encoder, &mut active_hevc_mode, &mut active_av1_mode);
                chosen = Some(encoder);
            } else {
                encoder_list.remove(pos);
            }
        }

        if chosen.is_none() {
            tracing::error!(
                "couldn't find any working encoder matching [{}]",
                settings.encoder
            );
        }
    }

    tracing::info!(
        "// Testing for available encoders, this may generate errors. You can safely ignore those errors. //"
    );

    // An encoder with the required codec support, if one was demanded
    if chosen.is_none() && (active_hevc_mode >= 2 || active_av1_mode >= 2) {
        let mut pos = 0;
        while pos < encoder_list.len() {
            let expect_failure = expect_failure_for(&encoder_list[pos]);
            if !validate_encoder(
                backend.as_ref(),
                &mut encoder_list[pos],
                settings,
                active_hevc_mode,
                active_av1_mode,
                expect_failure,
            ) {
                encoder_list.remove(pos);
                continue;
            }

            let encoder = &encoder_list[pos];
            if (active_hevc_mode >= 2 && !encoder.hevc.caps.passed)
                || (active_av1_mode >= 2 && !encoder.av1.caps.passed)
            {
                pos += 1;
                continue;
            }
            if (active_hevc_mode == 3 && !encoder.hevc.caps.dynamic_range)
                || (active_av1_mode == 3 && !encoder.av1.caps.dynamic_range)
            {
                pos += 1;
                continue;
            }

            chosen = Some(encoder_list.remove(pos));
            break;
        }

        if chosen.is_none() {
            tracing::error!("couldn't find any working encoder that meets HEVC/AV1 requirements");
        }
    }

    // Otherwise the first encoder that validates wins
    if chosen.is_none() {
        let mut pos = 0;
        while pos < encoder_list.len() {
            let expect_failure = expect_failure_for(&encoder_list[pos]);
            if !validate_encoder(
                backend.as_ref(),
                &mut encoder_list[pos],
                settings,
                active_hevc_mode,
                active_av1_mode,
                expect_failure,
            ) {
                encoder_list.remove(pos);
                continue;
            }

            let encoder = encoder_list.remove(pos);
            adjust_encoder_constraints(&encoder, &mut active_hevc_mode, &mut active_av1_mode);
            chosen = Some(encoder);
            break;
        }
    }

    let Some(encoder) = chosen else {
        tracing::error!("unable to find display or encoder during startup");
        if !settings.adapter_name.is_empty() || !settings.output_name.is_empty() {
            tracing::error!("please ensure your manually chosen GPU and monitor are connected and powered on");
        } else {
            tracing::error!("please check that a display is connected and powered on");
        }
        return Err(Error::NoEncoderFound);
    };

    dump_capabilities(&encoder, VideoFormat::H264);
    tracing::info!(
        "found H.264 encoder: {} [{}]",
        encoder.h264.name,
        encoder.name
    );
    if encoder.hevc.caps.passed {
        dump_capabilities(&encoder, VideoFormat::Hevc);
        tracing::info!(
            "found HEVC encoder: {} [{}]",
            encoder.hevc.name,
            encoder.name
        );
    }
    if encoder.av1.caps.passed {
        dump_capabilities(&encoder, VideoFormat::Av1);
        tracing::info!("found AV1 encoder: {} [{}]", encoder.av1.name, encoder.name);
    }

    if active_hevc_mode == 0 {
        active_hevc_mode = if encoder.hevc.caps.passed {
            if encoder.hevc.caps.dynamic_range {
                3
            } else {
                2
            }
        } else {
            1
        };
    }
    if active_av1_mode == 0 {
        active_av1_mode = if encoder.av1.caps.passed {
            if encoder.av1.caps.dynamic_range {
                3
            } else {
                2
            }
        } else {
            1
        };
    }

    Ok(ProbeOutcome {
        ref_frames_invalidation: encoder.flags.contains(EncoderFlags::REF_FRAMES_INVALIDATION),
        yuv444: [
            encoder.h264.caps.passed && encoder.h264.caps.yuv444,
            encoder.hevc.caps.passed && encoder.hevc.caps.yuv444,
            encoder.av1.caps.passed && encoder.av1.caps.yuv444,
        ],
        hevc_mode: active_hevc_mode,
        av1_mode: active_av1_mode,
        encoder: Arc::new(encoder),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::MockBackend;
    use crate::capture::DeviceInfo;
    use crate::encode::nvenc_native;

    fn backend() -> Arc<dyn DisplayBackend> {
        Arc::new(MockBackend::with_displays(vec!["DP-1".into()]))
    }

    fn test_registry() -> Registry {
        Registry {
            encoders: vec![nvenc_native()],
        }
    }

    #[test]
    fn test_probe_selects_encoder_and_fills_matrix() {
        let backend = backend();
        let settings = VideoSettings::default();
        let outcome = probe_encoders(&backend, test_registry(), &settings, None).unwrap();

        assert_eq!(outcome.encoder.name, "nvenc");
        assert!(outcome.encoder.h264.caps.passed);
        assert!(outcome.encoder.hevc.caps.passed);
        assert!(outcome.encoder.av1.caps.passed);
        // H.264 never advertises HDR
        assert!(!outcome.encoder.h264.caps.dynamic_range);
        assert!(outcome.encoder.hevc.caps.dynamic_range);
        // Native NVENC produces conformant headers
        assert!(outcome.encoder.h264.caps.vui_parameters);
        assert!(outcome.ref_frames_invalidation);
        assert_eq!(outcome.yuv444, [true, true, true]);
        // Auto modes resolve to "supported with HDR"
        assert_eq!(outcome.hevc_mode, 3);
        assert_eq!(outcome.av1_mode, 3);
    }

    #[test]
    fn test_probe_is_stable_without_device_changes() {
        let backend = backend();
        let settings = VideoSettings::default();
        let first = probe_encoders(&backend, test_registry(), &settings, None).unwrap();
        let second = probe_encoders(&backend, test_registry(), &settings, Some(&first)).unwrap();
        assert!(Arc::ptr_eq(&first.encoder, &second.encoder));
    }

    #[test]
    fn test_probe_refused_when_no_device_is_active() {
        let mock = MockBackend::with_displays(vec!["DP-1".into()]);
        mock.devices.lock().unwrap().push(DeviceInfo {
            id: "dev-1".into(),
            friendly_name: "Monitor".into(),
            active: false,
        });
        let backend: Arc<dyn DisplayBackend> = Arc::new(mock);
        let settings = VideoSettings::default();
        assert!(matches!(
            probe_encoders(&backend, test_registry(), &settings, None),
            Err(Error::Probe(_))
        ));
    }

    #[test]
    fn test_probe_allowed_when_enumeration_is_empty() {
        let backend = backend();
        let settings = VideoSettings::default();
        assert!(probe_encoders(&backend, test_registry(), &settings, None).is_ok());
    }

    #[test]
    fn test_probe_fails_without_displays() {
        let backend: Arc<dyn DisplayBackend> = Arc::new(MockBackend::with_displays(vec![]));
        let settings = VideoSettings::default();
        assert!(matches!(
            probe_encoders(&backend, test_registry(), &settings, None),
            Err(Error::NoEncoderFound)
        ));
    }

    #[test]
    fn test_named_encoder_is_preferred() {
        let backend = backend();
        let settings = VideoSettings {
            encoder: "nvenc".into(),
            ..Default::default()
        };
        let outcome = probe_encoders(&backend, test_registry(), &settings, None).unwrap();
        assert_eq!(outcome.encoder.name, "nvenc");
    }

    #[test]
    fn test_unknown_named_encoder_falls_back() {
        let backend = backend();
        let settings = VideoSettings {
            encoder: "quicksync".into(),
            ..Default::default()
        };
        // The requested encoder isn't in the registry; selection falls
        // through to the generic pass
        let outcome = probe_encoders(&backend, test_registry(), &settings, None).unwrap();
        assert_eq!(outcome.encoder.name, "nvenc");
    }
}
