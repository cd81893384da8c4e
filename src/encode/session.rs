//! Stateful encode sessions
//!
//! One session wraps either an avcodec encoder context (with manual SPS/VPS
//! header rewriting) or a native NVENC encoder. The per-frame contract is
//! convert → encode, with IDR and reference-invalidation requests applied
//! between frames.

use std::time::Instant;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::picture;

use crate::capture::Image;
use crate::cbs;
use crate::encode::device::{AvcodecEncodeDevice, NvencEncodeDevice};
use crate::error::{Error, Result};
use crate::events::EventQueue;
use crate::types::{ChannelData, Packet, ReplacementList};

/// AV_FRAME_FLAG_KEY
const FRAME_FLAG_KEY: i32 = 1 << 1;

/// Which headers get rewritten into IDR packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectMode {
    /// Encoder emits conformant headers, nothing to rewrite
    Off,
    /// Rewrite the H.264 SPS
    H264Sps,
    /// Rewrite the HEVC SPS and VPS
    HevcSpsVps,
}

/// Encode session over an avcodec encoder context
pub struct AvcodecSession {
    // The context must drop before the device: it references the device's
    // hardware frames
    ctx: ffmpeg::codec::context::Context,
    device: Box<dyn AvcodecEncodeDevice>,
    replacements: ReplacementList,
    inject: InjectMode,
    key_frame_requested: bool,
    display_index: i16,
}

// The codec context may be dropped on a different thread than it was
// created on (async teardown).
unsafe impl Send for AvcodecSession {}

impl AvcodecSession {
    pub(crate) fn new(
        ctx: ffmpeg::codec::context::Context,
        device: Box<dyn AvcodecEncodeDevice>,
        inject: InjectMode,
        display_index: i16,
    ) -> Self {
        Self {
            ctx,
            device,
            replacements: ReplacementList::default(),
            inject,
            key_frame_requested: false,
            display_index,
        }
    }

    fn encode_frame(
        &mut self,
        frame_nr: i64,
        packets: &EventQueue<Packet>,
        channel_data: Option<ChannelData>,
        frame_timestamp: Option<Instant>,
    ) -> Result<()> {
        self.device.frame_mut().set_pts(Some(frame_nr));

        let status = unsafe {
            ffi::avcodec_send_frame(self.ctx.as_mut_ptr(), self.device.frame().as_ptr())
        };
        if status < 0 {
            return Err(Error::EncodingFailed(format!(
                "could not send a frame for encoding: {}",
                ffmpeg::Error::from(status)
            )));
        }

        loop {
            let mut packet = ffmpeg::Packet::empty();
            let status = unsafe {
                ffi::avcodec_receive_packet(self.ctx.as_mut_ptr(), packet.as_mut_ptr())
            };
            if status < 0 {
                match ffmpeg::Error::from(status) {
                    ffmpeg::Error::Eof => return Ok(()),
                    ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => {
                        return Ok(())
                    }
                    e => {
                        return Err(Error::EncodingFailed(format!(
                            "could not receive packet: {}",
                            e
                        )))
                    }
                }
            }

            let idr = packet.is_key();
            if idr {
                tracing::debug!(
                    frame_nr,
                    display_index = self.display_index,
                    "IDR keyframe emitted"
                );
            }
            if self.key_frame_requested && !idr {
                tracing::error!("encoder did not produce IDR frame when requested");
            }

            if self.inject != InjectMode::Off && idr {
                self.stage_replacements(&packet);
                self.inject = InjectMode::Off;
            }

            let pts = packet.pts();
            let out = Packet {
                data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
                frame_index: pts.unwrap_or(frame_nr),
                idr,
                after_ref_frame_invalidation: false,
                frame_timestamp: if pts == Some(frame_nr) {
                    frame_timestamp
                } else {
                    None
                },
                replacements: Some(self.replacements.clone()),
                channel_data: channel_data.clone(),
                display_index: self.display_index,
            };
            packets.raise(out);
        }
    }

    /// Parse the emitted headers out of the first IDR packet and stage the
    /// byte ranges downstream substitutes before transport
    fn stage_replacements(&mut self, packet: &ffmpeg::Packet) {
        let data = packet.data().unwrap_or_default();
        let colorspace = self.device.colorspace();

        let Ok(mut replacements) = self.replacements.lock() else {
            return;
        };
        match self.inject {
            InjectMode::H264Sps => match cbs::make_sps_h264(data, &colorspace) {
                Some(sps) => replacements.push(sps),
                None => tracing::warn!("could not rewrite H.264 SPS"),
            },
            InjectMode::HevcSpsVps => match cbs::make_sps_hevc(data, &colorspace) {
                Some((vps, sps)) => {
                    replacements.push(vps);
                    replacements.push(sps);
                }
                None => tracing::warn!("could not rewrite HEVC SPS/VPS"),
            },
            InjectMode::Off => {}
        }
    }
}

impl Drop for AvcodecSession {
    fn drop(&mut self) {
        // Flush any remaining frames in the encoder
        unsafe {
            if ffi::avcodec_send_frame(self.ctx.as_mut_ptr(), std::ptr::null()) == 0 {
                let mut packet = ffmpeg::Packet::empty();
                while ffi::avcodec_receive_packet(self.ctx.as_mut_ptr(), packet.as_mut_ptr()) == 0 {
                }
            }
        }
    }
}

/// Encode session over the native NVENC encoder
pub struct NvencSession {
    device: Box<dyn NvencEncodeDevice>,
    force_idr: bool,
    display_index: i16,
}

impl NvencSession {
    pub(crate) fn new(device: Box<dyn NvencEncodeDevice>, display_index: i16) -> Self {
        Self {
            device,
            force_idr: false,
            display_index,
        }
    }

    fn encode_frame(
        &mut self,
        frame_nr: i64,
        packets: &EventQueue<Packet>,
        channel_data: Option<ChannelData>,
        frame_timestamp: Option<Instant>,
    ) -> Result<()> {
        let encoded = self.device.encode_frame(frame_nr as u64, self.force_idr)?;
        self.force_idr = false;

        if encoded.data.is_empty() {
            tracing::error!("NVENC returned an empty packet");
            return Err(Error::EncodingFailed("empty NVENC packet".into()));
        }
        if encoded.frame_index != frame_nr as u64 {
            tracing::error!(
                expected = frame_nr,
                actual = encoded.frame_index,
                "NVENC frame index mismatch"
            );
        }

        packets.raise(Packet {
            data: encoded.data,
            frame_index: encoded.frame_index as i64,
            idr: encoded.idr,
            after_ref_frame_invalidation: encoded.after_ref_frame_invalidation,
            frame_timestamp,
            replacements: None,
            channel_data,
            display_index: self.display_index,
        });
        Ok(())
    }
}

/// A constructed per-display encode session
pub enum EncodeSession {
    Avcodec(AvcodecSession),
    Nvenc(NvencSession),
}

impl EncodeSession {
    /// Load a captured image into the encoder input. Must precede the
    /// first `encode` for a frame; repeated calls simply refresh the input.
    pub fn convert(&mut self, img: &Image) -> Result<()> {
        match self {
            EncodeSession::Avcodec(session) => session.device.convert(img),
            EncodeSession::Nvenc(session) => session.device.convert(img),
        }
    }

    /// Make the next encoded frame an IDR
    pub fn request_idr_frame(&mut self) {
        match self {
            EncodeSession::Avcodec(session) => {
                let frame = session.device.frame_mut();
                frame.set_kind(picture::Type::I);
                unsafe {
                    (*frame.as_mut_ptr()).flags |= FRAME_FLAG_KEY;
                }
                session.key_frame_requested = true;
            }
            EncodeSession::Nvenc(session) => session.force_idr = true,
        }
    }

    /// Clear a pending IDR request once the IDR frame has been submitted
    pub fn request_normal_frame(&mut self) {
        match self {
            EncodeSession::Avcodec(session) => {
                let frame = session.device.frame_mut();
                frame.set_kind(picture::Type::None);
                unsafe {
                    (*frame.as_mut_ptr()).flags &= !FRAME_FLAG_KEY;
                }
                session.key_frame_requested = false;
            }
            EncodeSession::Nvenc(session) => session.force_idr = false,
        }
    }

    /// Ask the encoder to forget a range of reference frames, falling back
    /// to an IDR when that's not possible
    pub fn invalidate_ref_frames(&mut self, first: i64, last: i64) {
        match self {
            EncodeSession::Avcodec(_) => {
                tracing::error!("encoder doesn't support reference frame invalidation");
                self.request_idr_frame();
            }
            EncodeSession::Nvenc(session) => {
                if !session.device.invalidate_ref_frames(first, last) {
                    session.force_idr = true;
                }
            }
        }
    }

    /// Encode the converted frame as `frame_nr`, pushing 0..N packets into
    /// the sink
    pub fn encode(
        &mut self,
        frame_nr: i64,
        packets: &EventQueue<Packet>,
        channel_data: Option<ChannelData>,
        frame_timestamp: Option<Instant>,
    ) -> Result<()> {
        match self {
            EncodeSession::Avcodec(session) => {
                session.encode_frame(frame_nr, packets, channel_data, frame_timestamp)
            }
            EncodeSession::Nvenc(session) => {
                session.encode_frame(frame_nr, packets, channel_data, frame_timestamp)
            }
        }
    }

    pub fn display_index(&self) -> i16 {
        match self {
            EncodeSession::Avcodec(session) => session.display_index,
            EncodeSession::Nvenc(session) => session.display_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::MockNvencDevice;

    fn nvenc_session() -> EncodeSession {
        EncodeSession::Nvenc(NvencSession::new(Box::new(MockNvencDevice::new()), 3))
    }

    #[test]
    fn test_nvenc_packets_are_stamped() {
        let mut session = nvenc_session();
        let packets = EventQueue::unbounded();
        session.convert(&Image::default()).unwrap();

        session.encode(1, &packets, None, None).unwrap();
        let packet = packets.pop().unwrap();
        assert_eq!(packet.display_index, 3);
        assert_eq!(packet.frame_index, 1);
        assert!(packet.idr);
        assert!(packet.replacements.is_none());

        session.encode(2, &packets, None, None).unwrap();
        let packet = packets.pop().unwrap();
        assert_eq!(packet.frame_index, 2);
        assert!(!packet.idr);
    }

    #[test]
    fn test_nvenc_idr_request_round_trip() {
        let mut session = nvenc_session();
        let packets = EventQueue::unbounded();
        session.convert(&Image::default()).unwrap();
        session.encode(1, &packets, None, None).unwrap();
        packets.pop().unwrap();

        session.request_idr_frame();
        session.encode(2, &packets, None, None).unwrap();
        assert!(packets.pop().unwrap().idr);

        // The request is consumed by the encode
        session.encode(3, &packets, None, None).unwrap();
        assert!(!packets.pop().unwrap().idr);
    }

    #[test]
    fn test_nvenc_invalidation_marks_next_packet() {
        let mut session = nvenc_session();
        let packets = EventQueue::unbounded();
        session.convert(&Image::default()).unwrap();
        session.encode(1, &packets, None, None).unwrap();
        packets.pop().unwrap();

        session.invalidate_ref_frames(0, 1);
        session.encode(2, &packets, None, None).unwrap();
        let packet = packets.pop().unwrap();
        assert!(packet.after_ref_frame_invalidation);
        assert!(!packet.idr);
    }

    #[test]
    fn test_nvenc_invalidation_failure_falls_back_to_idr() {
        let mut device = MockNvencDevice::new();
        device.invalidation_supported = false;
        let mut session = EncodeSession::Nvenc(NvencSession::new(Box::new(device), 0));
        let packets = EventQueue::unbounded();
        session.convert(&Image::default()).unwrap();
        session.encode(1, &packets, None, None).unwrap();
        packets.pop().unwrap();

        session.invalidate_ref_frames(0, 1);
        session.encode(2, &packets, None, None).unwrap();
        let packet = packets.pop().unwrap();
        assert!(packet.idr);
        assert!(!packet.after_ref_frame_invalidation);
    }

    #[test]
    fn test_encode_before_convert_fails() {
        let mut session = nvenc_session();
        let packets = EventQueue::unbounded();
        assert!(session.encode(1, &packets, None, None).is_err());
    }
}
