//! Encode devices
//!
//! An encode device owns the frame the encoder consumes and knows how to
//! get captured images into it. Hardware-capable platform layers implement
//! [`AvcodecEncodeDevice`] (or [`NvencEncodeDevice`]) themselves; capture
//! backends that only produce system-memory BGR images are wrapped in
//! [`SoftwareEncodeDevice`], which scales and color-converts on the CPU.

use std::ffi::c_void;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags as ScalerFlags};
use ffmpeg_next::Dictionary;

use crate::capture::Image;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{Colorspace, HwDeviceType, PixelFormat};

/// One frame returned by the native NVENC encoder
#[derive(Debug, Default, Clone)]
pub struct NvencEncodedFrame {
    pub data: Vec<u8>,
    pub frame_index: u64,
    pub idr: bool,
    pub after_ref_frame_invalidation: bool,
}

/// Native NVENC encode device, implemented by the platform layer
pub trait NvencEncodeDevice: Send {
    fn colorspace(&self) -> Colorspace;
    fn set_colorspace(&mut self, colorspace: Colorspace);

    /// Initialize the hardware encoder for this stream
    fn init_encoder(&mut self, config: &ClientConfig, colorspace: Colorspace) -> Result<()>;

    /// Load a captured image into the encoder input surface
    fn convert(&mut self, img: &Image) -> Result<()>;

    /// Encode the current surface
    fn encode_frame(&mut self, frame_index: u64, force_idr: bool) -> Result<NvencEncodedFrame>;

    /// Tell the encoder to forget the given reference frame range. Returns
    /// false when the driver refused; the caller falls back to an IDR.
    fn invalidate_ref_frames(&mut self, first: i64, last: i64) -> bool;
}

/// Encode device feeding an avcodec encoder
pub trait AvcodecEncodeDevice: Send {
    fn colorspace(&self) -> Colorspace;
    fn set_colorspace(&mut self, colorspace: Colorspace);

    /// Native device handle backing hardware frames (e.g. the D3D11
    /// device). `None` means captured images live in system memory and the
    /// session factory wraps this device in a [`SoftwareEncodeDevice`].
    fn native_device(&self) -> Option<*mut c_void> {
        None
    }

    /// Load a captured image into the encoder frame
    fn convert(&mut self, img: &Image) -> Result<()>;

    /// Take ownership of the frame the encoder will consume. When
    /// `hw_frames_ctx` is set the device allocates the frame's buffers out
    /// of that pool.
    fn set_frame(&mut self, frame: frame::Video, hw_frames_ctx: Option<*mut ffi::AVBufferRef>)
        -> Result<()>;

    fn frame(&self) -> &frame::Video;
    fn frame_mut(&mut self) -> &mut frame::Video;

    /// Apply the stream colorspace to any internal conversion state
    fn apply_colorspace(&mut self) {}

    /// Adjust hwframe pool parameters before the pool is initialized
    fn init_hwframes(&mut self, _frames: *mut ffi::AVHWFramesContext) -> Result<()> {
        Ok(())
    }

    /// Pre-stage state required before the base hwdevice is derived into
    /// `derived_type`
    fn prepare_to_derive_context(&mut self, _derived_type: HwDeviceType) -> Result<()> {
        Ok(())
    }

    /// Final opportunity to set or override codec options
    fn init_codec_options(&mut self, _ctx: *mut ffi::AVCodecContext, _options: &mut Dictionary) {}
}

/// Either encode path, produced by the session factory
pub enum EncodeDevice {
    Avcodec(Box<dyn AvcodecEncodeDevice>),
    Nvenc(Box<dyn NvencEncodeDevice>),
}

impl EncodeDevice {
    pub fn colorspace(&self) -> Colorspace {
        match self {
            EncodeDevice::Avcodec(dev) => dev.colorspace(),
            EncodeDevice::Nvenc(dev) => dev.colorspace(),
        }
    }
}

/// Per-plane (chroma shift w, chroma shift h, bytes per sample) of the
/// planar software formats
fn plane_layout(fmt: PixelFormat) -> Result<&'static [(u32, u32, usize)]> {
    match fmt {
        PixelFormat::Yuv420p => Ok(&[(0, 0, 1), (1, 1, 1), (1, 1, 1)]),
        PixelFormat::Yuv420p10 => Ok(&[(0, 0, 2), (1, 1, 2), (1, 1, 2)]),
        PixelFormat::Yuv444p => Ok(&[(0, 0, 1), (0, 0, 1), (0, 0, 1)]),
        PixelFormat::Yuv444p10 => Ok(&[(0, 0, 2), (0, 0, 2), (0, 0, 2)]),
        PixelFormat::Nv12 => Ok(&[(0, 0, 1), (1, 1, 2)]),
        PixelFormat::P010 => Ok(&[(0, 0, 2), (1, 1, 4)]),
        other => Err(Error::Scaling(format!(
            "no software plane layout for {:?}",
            other
        ))),
    }
}

/// Fill a frame with black, respecting its pixel format and color range
fn fill_black(frame: &mut frame::Video) -> Result<()> {
    let format: ffi::AVPixelFormat = frame.format().into();
    unsafe {
        let raw = frame.as_mut_ptr();
        let mut data = [std::ptr::null_mut::<u8>(); 4];
        let mut linesize = [0isize; 4];
        for i in 0..4 {
            data[i] = (*raw).data[i];
            linesize[i] = (*raw).linesize[i] as isize;
        }
        let ret = ffi::av_image_fill_black(
            data.as_mut_ptr(),
            linesize.as_ptr(),
            format,
            (*raw).color_range,
            (*raw).width,
            (*raw).height,
        );
        if ret < 0 {
            return Err(Error::Scaling("failed to prefill frame".into()));
        }
    }
    Ok(())
}

/// Copy a scaled frame into a padded destination line by line, preserving
/// the leading padding of each row
fn copy_padded(
    fmt: PixelFormat,
    offset_w: u32,
    offset_h: u32,
    src: &frame::Video,
    dst: &mut frame::Video,
) -> Result<()> {
    let layout = plane_layout(fmt)?;
    for (plane, &(shift_w, shift_h, bps)) in layout.iter().enumerate() {
        let src_stride = src.stride(plane);
        let dst_stride = dst.stride(plane);
        let row_bytes = (src.width() as usize >> shift_w) * bps;
        let offset =
            ((offset_w as usize) >> shift_w) * bps + ((offset_h as usize) >> shift_h) * dst_stride;
        let rows = src.height() as usize >> shift_h;

        for line in 0..rows {
            let src_row = &src.data(plane)[line * src_stride..line * src_stride + row_bytes];
            let dst_start = offset + line * dst_stride;
            dst.data_mut(plane)[dst_start..dst_start + row_bytes].copy_from_slice(src_row);
        }
    }
    Ok(())
}

/// CPU scaling and color conversion front-end for system-memory captures
///
/// Scales the BGR0 capture into an aspect-padded YUV frame with Lanczos
/// filtering and accurate rounding, then uploads into hardware frames when
/// the codec wants them.
pub struct SoftwareEncodeDevice {
    colorspace: Colorspace,
    /// Frame handed to the encoder (may be a hardware frame)
    target: Option<frame::Video>,
    /// Staging frame in `sw_fmt` when the target is hardware
    sw_target: Option<frame::Video>,
    /// Reusable BGR0 input frame at capture dimensions
    input: frame::Video,
    /// Intermediate scaled frame, present only when aspect padding applies
    scaled: Option<frame::Video>,
    sws: Scaler,
    sw_fmt: PixelFormat,
    hardware: bool,
    offset_w: u32,
    offset_h: u32,
}

// The scaler and frames are plain heap state without thread affinity; the
// session owning this device may be torn down on a helper thread.
unsafe impl Send for SoftwareEncodeDevice {}

impl SoftwareEncodeDevice {
    /// `in_width`/`in_height` are the capture dimensions, `out_width`/
    /// `out_height` the codec frame dimensions.
    pub fn new(
        in_width: u32,
        in_height: u32,
        out_width: u32,
        out_height: u32,
        sw_fmt: PixelFormat,
        hardware: bool,
        colorspace: Colorspace,
    ) -> Result<Self> {
        ffmpeg::init().map_err(|e| Error::Ffmpeg(e.to_string()))?;

        // Maintain the capture aspect ratio inside the output frame
        let scalar =
            (out_width as f32 / in_width as f32).min(out_height as f32 / in_height as f32);
        let scaled_width = (in_width as f32 * scalar) as u32;
        let scaled_height = (in_height as f32 * scalar) as u32;

        let offset_w = (out_width - scaled_width) / 2;
        let offset_h = (out_height - scaled_height) / 2;
        let requires_padding = scaled_width != out_width || scaled_height != out_height;

        let sws = Scaler::get(
            Pixel::BGRZ,
            in_width,
            in_height,
            sw_fmt.to_av(),
            scaled_width,
            scaled_height,
            ScalerFlags::LANCZOS | ScalerFlags::ACCURATE_RND,
        )
        .map_err(|e| Error::Scaling(format!("failed to create scaler: {}", e)))?;

        let mut sw_target = None;
        if hardware {
            let mut staging = frame::Video::new(sw_fmt.to_av(), out_width, out_height);
            unsafe {
                (*staging.as_mut_ptr()).color_range =
                    crate::types::AvColorMapping::from(colorspace).range.into();
            }
            fill_black(&mut staging)?;
            sw_target = Some(staging);
        }

        Ok(Self {
            colorspace,
            target: None,
            sw_target,
            input: frame::Video::new(Pixel::BGRZ, in_width, in_height),
            scaled: requires_padding
                .then(|| frame::Video::new(sw_fmt.to_av(), scaled_width, scaled_height)),
            sws,
            sw_fmt,
            hardware,
            offset_w,
            offset_h,
        })
    }

}

impl AvcodecEncodeDevice for SoftwareEncodeDevice {
    fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    fn set_colorspace(&mut self, colorspace: Colorspace) {
        self.colorspace = colorspace;
    }

    fn convert(&mut self, img: &Image) -> Result<()> {
        if self.target.is_none() {
            return Err(Error::EncodingFailed("encode frame not set".into()));
        }

        // Stage the caller's image into the reusable BGR0 input frame
        let in_stride = self.input.stride(0);
        let row_bytes = (self.input.width() as usize * 4).min(img.row_pitch);
        let rows = (self.input.height() as usize).min(img.height as usize);
        for line in 0..rows {
            let src = &img.data[line * img.row_pitch..line * img.row_pitch + row_bytes];
            self.input.data_mut(0)[line * in_stride..line * in_stride + row_bytes]
                .copy_from_slice(src);
        }

        // Scale into the intermediate frame when aspect padding applies,
        // otherwise straight into the software destination
        if let Some(scaled) = self.scaled.as_mut() {
            self.sws
                .run(&self.input, scaled)
                .map_err(|e| Error::Scaling(format!("couldn't scale frame: {}", e)))?;
        } else {
            let dst = if self.hardware {
                self.sw_target.as_mut().expect("hardware staging frame")
            } else {
                self.target.as_mut().expect("checked above")
            };
            self.sws
                .run(&self.input, dst)
                .map_err(|e| Error::Scaling(format!("couldn't scale frame: {}", e)))?;
        }

        if let Some(scaled) = self.scaled.as_ref() {
            let dst = if self.hardware {
                self.sw_target.as_mut().expect("hardware staging frame")
            } else {
                self.target.as_mut().expect("checked above")
            };
            copy_padded(self.sw_fmt, self.offset_w, self.offset_h, scaled, dst)?;
        }

        // A hardware target still needs the upload from main memory
        if self.hardware {
            let sw = self.sw_target.as_ref().expect("hardware staging frame");
            let target = self.target.as_mut().expect("checked above");
            let ret = unsafe {
                ffi::av_hwframe_transfer_data(target.as_mut_ptr(), sw.as_ptr(), 0)
            };
            if ret < 0 {
                return Err(Error::EncodingFailed(
                    "failed to transfer image data to hardware frame".into(),
                ));
            }
        }

        Ok(())
    }

    fn set_frame(
        &mut self,
        mut frame: frame::Video,
        hw_frames_ctx: Option<*mut ffi::AVBufferRef>,
    ) -> Result<()> {
        if let Some(frames_ctx) = hw_frames_ctx {
            let ret = unsafe { ffi::av_hwframe_get_buffer(frames_ctx, frame.as_mut_ptr(), 0) };
            if ret < 0 {
                return Err(Error::EncoderInit(
                    "failed to allocate hardware frame".into(),
                ));
            }
        } else if !self.hardware {
            fill_black(&mut frame)?;
        }
        self.target = Some(frame);
        Ok(())
    }

    fn frame(&self) -> &frame::Video {
        self.target.as_ref().expect("set_frame precedes frame access")
    }

    fn frame_mut(&mut self) -> &mut frame::Video {
        self.target.as_mut().expect("set_frame precedes frame access")
    }

    fn apply_colorspace(&mut self) {
        unsafe {
            ffi::sws_setColorspaceDetails(
                self.sws.as_mut_ptr(),
                ffi::sws_getCoefficients(ffi::SWS_CS_DEFAULT as i32),
                0,
                ffi::sws_getCoefficients(self.colorspace.sws_coefficients()),
                self.colorspace.full_range as i32,
                0,
                1 << 16,
                1 << 16,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_layouts() {
        assert_eq!(plane_layout(PixelFormat::Yuv420p).unwrap().len(), 3);
        assert_eq!(plane_layout(PixelFormat::Nv12).unwrap().len(), 2);
        assert!(plane_layout(PixelFormat::Bgr0).is_err());
    }

    #[test]
    fn test_aspect_padding_offsets() {
        // 1024x768 capture into a 1920x1080 stream: height-limited, pillarbox
        let device = match SoftwareEncodeDevice::new(
            1024,
            768,
            1920,
            1080,
            PixelFormat::Yuv420p,
            false,
            Colorspace::default(),
        ) {
            Ok(device) => device,
            // No swscale available in this environment; nothing to verify
            Err(Error::Scaling(_)) | Err(Error::Ffmpeg(_)) => return,
            Err(e) => panic!("unexpected error: {}", e),
        };
        let scalar = 1080.0f32 / 768.0;
        let scaled_width = (1024.0 * scalar) as u32;
        assert_eq!(device.offset_w, (1920 - scaled_width) / 2);
        assert_eq!(device.offset_h, 0);
        assert!(device.scaled.is_some());
    }

    #[test]
    fn test_matching_aspect_needs_no_padding() {
        let device = match SoftwareEncodeDevice::new(
            1920,
            1080,
            1920,
            1080,
            PixelFormat::Yuv420p,
            false,
            Colorspace::default(),
        ) {
            Ok(device) => device,
            Err(Error::Scaling(_)) | Err(Error::Ffmpeg(_)) => return,
            Err(e) => panic!("unexpected error: {}", e),
        };
        assert!(device.scaled.is_none());
        assert_eq!(device.offset_w, 0);
        assert_eq!(device.offset_h, 0);
    }
}
