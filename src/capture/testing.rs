//! Mock display backend used by the unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::capture::{
    CaptureStatus, CursorConfig, Display, DisplayBackend, Image, PullFree, PushCaptured,
    SharedImage,
};
use crate::config::ClientConfig;
use crate::encode::{AvcodecEncodeDevice, NvencEncodeDevice, NvencEncodedFrame};
use crate::error::{Error, Result};
use crate::types::{Colorspace, HdrMetadata, MemType, PixelFormat};

pub(crate) struct MockDisplay {
    pub width: u32,
    pub height: u32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub env_width: i32,
    pub env_height: i32,
    pub hdr: bool,
    /// Statuses returned by successive capture calls once their frame
    /// budget runs out
    pub capture_plan: Mutex<VecDeque<CaptureStatus>>,
    /// Frames produced per capture call before consulting the plan
    pub frames_per_capture: usize,
}

impl MockDisplay {
    pub fn new() -> Self {
        Self::with_geometry(1920, 1080, 0, 0, 1920, 1080)
    }

    pub fn with_geometry(
        width: u32,
        height: u32,
        offset_x: i32,
        offset_y: i32,
        env_width: i32,
        env_height: i32,
    ) -> Self {
        Self {
            width,
            height,
            offset_x,
            offset_y,
            env_width,
            env_height,
            hdr: false,
            capture_plan: Mutex::new(VecDeque::new()),
            frames_per_capture: usize::MAX,
        }
    }
}

impl Display for MockDisplay {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn env_width(&self) -> i32 {
        self.env_width
    }

    fn env_height(&self) -> i32 {
        self.env_height
    }

    fn offset_x(&self) -> i32 {
        self.offset_x
    }

    fn offset_y(&self) -> i32 {
        self.offset_y
    }

    fn alloc_img(&self) -> Result<SharedImage> {
        let row_pitch = self.width as usize * 4;
        Ok(Arc::new(Mutex::new(Image {
            data: vec![0u8; row_pitch * self.height as usize],
            row_pitch,
            width: self.width,
            height: self.height,
            pixel_format: PixelFormat::Bgr0,
            frame_timestamp: None,
        })))
    }

    fn dummy_img(&self, img: &SharedImage) -> Result<()> {
        let mut inner = img.lock().map_err(|_| Error::Capture("poisoned image".into()))?;
        inner.data.fill(0);
        Ok(())
    }

    fn is_hdr(&self) -> bool {
        self.hdr
    }

    fn hdr_metadata(&self) -> Option<HdrMetadata> {
        self.hdr.then(|| HdrMetadata {
            max_display_luminance: 1000,
            max_content_light_level: 1000,
            max_frame_average_light_level: 400,
            ..Default::default()
        })
    }

    fn is_codec_supported(&self, _codec_name: &str, _config: &ClientConfig) -> bool {
        true
    }

    fn capture(
        &self,
        push: &mut PushCaptured<'_>,
        pull: &mut PullFree<'_>,
        _cursor: &CursorConfig,
    ) -> CaptureStatus {
        let mut produced = 0usize;
        loop {
            if produced >= self.frames_per_capture {
                return self
                    .capture_plan
                    .lock()
                    .ok()
                    .and_then(|mut plan| plan.pop_front())
                    .unwrap_or(CaptureStatus::Timeout);
            }

            let Some(img) = pull() else {
                return CaptureStatus::Ok;
            };
            if let Ok(mut inner) = img.lock() {
                inner.frame_timestamp = Some(Instant::now());
            }
            produced += 1;

            if !push(img, true) {
                return CaptureStatus::Ok;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn make_avcodec_encode_device(
        &self,
        _pix_fmt: PixelFormat,
    ) -> Result<Box<dyn AvcodecEncodeDevice>> {
        Err(Error::EncoderInit("mock display has no avcodec device".into()))
    }

    fn make_nvenc_encode_device(
        &self,
        _pix_fmt: PixelFormat,
    ) -> Result<Box<dyn NvencEncodeDevice>> {
        Ok(Box::new(MockNvencDevice::new()))
    }
}

/// NVENC encode device double: emits a deterministic packet per frame
pub(crate) struct MockNvencDevice {
    colorspace: Colorspace,
    frames_encoded: u64,
    converted: bool,
    pub invalidation_supported: bool,
    after_invalidation: bool,
}

impl MockNvencDevice {
    pub fn new() -> Self {
        Self {
            colorspace: Colorspace::default(),
            frames_encoded: 0,
            converted: false,
            invalidation_supported: true,
            after_invalidation: false,
        }
    }
}

impl NvencEncodeDevice for MockNvencDevice {
    fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    fn set_colorspace(&mut self, colorspace: Colorspace) {
        self.colorspace = colorspace;
    }

    fn init_encoder(&mut self, config: &ClientConfig, _colorspace: Colorspace) -> Result<()> {
        config.validate()
    }

    fn convert(&mut self, _img: &Image) -> Result<()> {
        self.converted = true;
        Ok(())
    }

    fn encode_frame(&mut self, frame_index: u64, force_idr: bool) -> Result<NvencEncodedFrame> {
        if !self.converted {
            return Err(Error::EncodingFailed("no frame converted".into()));
        }
        let idr = force_idr || self.frames_encoded == 0;
        self.frames_encoded += 1;
        let after = std::mem::take(&mut self.after_invalidation);
        Ok(NvencEncodedFrame {
            data: vec![0xAB; 128],
            frame_index,
            idr,
            after_ref_frame_invalidation: after,
        })
    }

    fn invalidate_ref_frames(&mut self, _first: i64, _last: i64) -> bool {
        if self.invalidation_supported {
            self.after_invalidation = true;
        }
        self.invalidation_supported
    }
}

/// Backend double over a mutable display name list
pub(crate) struct MockBackend {
    pub names: Mutex<Vec<String>>,
    pub devices: Mutex<Vec<crate::capture::DeviceInfo>>,
    pub hdr: AtomicBool,
    pub opens: AtomicUsize,
    /// Open attempts to fail before succeeding
    pub failures_remaining: AtomicUsize,
}

impl MockBackend {
    pub fn with_displays(names: Vec<String>) -> Self {
        Self {
            names: Mutex::new(names),
            devices: Mutex::new(Vec::new()),
            hdr: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
        }
    }
}

impl DisplayBackend for MockBackend {
    fn display_names(&self, _mem_type: MemType) -> Vec<String> {
        self.names.lock().map(|n| n.clone()).unwrap_or_default()
    }

    fn enumerate_devices(&self) -> Vec<crate::capture::DeviceInfo> {
        self.devices.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn open_display(
        &self,
        _mem_type: MemType,
        name: &str,
        _config: &ClientConfig,
    ) -> Option<Arc<dyn Display>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return None;
        }

        let names = self.names.lock().ok()?;
        let index = names.iter().position(|n| n == name)? as i32;
        let mut display = MockDisplay::with_geometry(
            1920,
            1080,
            index * 1920,
            0,
            1920 * names.len().max(1) as i32,
            1080,
        );
        display.hdr = self.hdr.load(Ordering::SeqCst);
        Some(Arc::new(display))
    }
}
