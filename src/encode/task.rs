//! Per-display encode task
//!
//! Peer of the capture task. Acquires the display through the shared weak
//! slot, builds the encode session, consumes captured images and emits
//! packets. When the capture side reinitializes the display, the session is
//! torn down and rebuilt against the new handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::capture::{CaptureContext, Display, DisplayBackend, DisplaySlot, SharedImage, ThreadPriority};
use crate::config::{ClientConfig, VideoSettings};
use crate::control;
use crate::encode::session::EncodeSession;
use crate::encode::{factory, EncoderDescriptor, EncoderFlags};
use crate::error::Result;
use crate::events::{EventQueue, SessionEvents, StreamEvents};
use crate::types::{ChannelData, HdrInfo, TouchPorts};

/// Encode task entry point, run on a dedicated OS thread
#[allow(clippy::too_many_arguments)]
pub fn encode_thread(
    backend: Arc<dyn DisplayBackend>,
    events: StreamEvents,
    session_events: Arc<SessionEvents>,
    ctx_queue: EventQueue<CaptureContext>,
    display_slot: DisplaySlot,
    encoder: Arc<EncoderDescriptor>,
    settings: Arc<VideoSettings>,
    images: EventQueue<SharedImage>,
    config: ClientConfig,
    touch_ports: Arc<Mutex<TouchPorts>>,
    encode_running: Arc<AtomicBool>,
    channel_data: Option<ChannelData>,
) {
    tracing::info!(display_index = config.display_index, "encode task starting");

    // The frame counter survives session rebuilds so packet indices stay
    // monotonic across display reinits
    let mut frame_index: i64 = 1;

    while encode_running.load(Ordering::SeqCst) && ctx_queue.running() && images.running() {
        // Wait out a display reinitialization
        if session_events.reinit.peek() {
            thread::sleep(Duration::from_millis(20));
            continue;
        }

        // Wait for the capture task to publish the display
        let display = display_slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|weak| weak.upgrade()));
        let Some(display) = display else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };

        // Absolute pointer input needs the display geometry; publish the
        // updated union before streaming starts
        if let Ok(mut ports) = touch_ports.lock() {
            control::make_port(&mut ports, display.as_ref(), &config);
            events.touch_port.raise(ports.clone());
        }

        encode_run(
            &backend,
            &events,
            &session_events,
            display,
            &encoder,
            &settings,
            &images,
            &config,
            &mut frame_index,
            channel_data.clone(),
        );
    }

    tracing::info!(display_index = config.display_index, "encode task stopped");
}

#[allow(clippy::too_many_arguments)]
fn encode_run(
    backend: &Arc<dyn DisplayBackend>,
    events: &StreamEvents,
    session_events: &Arc<SessionEvents>,
    display: Arc<dyn Display>,
    encoder: &Arc<EncoderDescriptor>,
    settings: &Arc<VideoSettings>,
    images: &EventQueue<SharedImage>,
    config: &ClientConfig,
    frame_index: &mut i64,
    channel_data: Option<ChannelData>,
) {
    let device = match factory::make_encode_device(display.as_ref(), encoder, config) {
        Ok(device) => device,
        Err(e) => {
            tracing::error!("could not create encode device: {}", e);
            return;
        }
    };
    tracing::info!(display_index = config.display_index, "encode device ready");

    backend.adjust_thread_priority(ThreadPriority::High);

    // Update the client with our current HDR display state
    let colorspace = device.colorspace();
    let mut hdr_info = HdrInfo::default();
    if colorspace.is_hdr() {
        match display.hdr_metadata() {
            Some(metadata) => {
                hdr_info.enabled = true;
                hdr_info.metadata = metadata;
            }
            None => tracing::error!(
                "couldn't get display hdr metadata when colorspace selection indicates it should have one"
            ),
        }
    }
    events.hdr.raise(hdr_info);

    let mut session = match factory::make_encode_session(
        display.as_ref(),
        encoder,
        settings,
        config,
        display.width(),
        display.height(),
        device,
    ) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("could not create encode session: {}", e);
            return;
        }
    };
    tracing::info!(display_index = config.display_index, "encode session ready");

    let _ = run_frames(
        events,
        session_events,
        &display,
        settings,
        images,
        config,
        frame_index,
        &mut session,
        channel_data,
    );

    // Complete expensive encoder teardown off this thread where supported,
    // so a hung driver can't stall the reinit path
    if encoder.flags.contains(EncoderFlags::ASYNC_TEARDOWN) {
        thread::spawn(move || {
            tracing::info!("starting async encoder teardown");
            drop(session);
            tracing::info!("async encoder teardown complete");
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn run_frames(
    events: &StreamEvents,
    session_events: &Arc<SessionEvents>,
    display: &Arc<dyn Display>,
    settings: &Arc<VideoSettings>,
    images: &EventQueue<SharedImage>,
    config: &ClientConfig,
    frame_index: &mut i64,
    session: &mut EncodeSession,
    channel_data: Option<ChannelData>,
) -> Result<()> {
    {
        // Load a dummy image so there is something to encode even if the
        // first real frame never arrives. The buffer is large, so free it
        // right after convert().
        let img = display.alloc_img()?;
        display.dummy_img(&img)?;
        let guard = img
            .lock()
            .map_err(|_| crate::error::Error::Capture("poisoned image".into()))?;
        session.convert(&guard)?;
    }

    // Encode at a minimum FPS to keep static content alive downstream
    let target_fps = settings
        .minimum_fps_target
        .max(config.framerate as f64)
        .max(1.0);
    let max_frametime = Duration::from_secs_f64(1.0 / target_fps);
    tracing::info!(
        "minimum FPS target set to ~{:.1}fps ({:.1}ms)",
        target_fps / 2.0,
        max_frametime.as_secs_f64() * 2000.0
    );

    loop {
        // Stop encoding when the stream ends, the capture side is gone, or
        // it is waiting to reinit and at least one frame has been emitted
        // so downstream knows this session is alive
        if events.shutdown.peek() || !images.running() {
            break;
        }
        if session_events.reinit.peek() && *frame_index > 1 {
            break;
        }

        while let Some((first, last)) = session_events.invalidate_ref_frames.pop() {
            session.invalidate_ref_frames(first, last);
        }

        let requested_idr_frame = session_events.idr.pop().is_some();
        if requested_idr_frame {
            session.request_idr_frame();
            tracing::debug!(display_index = config.display_index, "IDR frame requested");
        }

        let mut frame_timestamp = None;
        if !requested_idr_frame || images.peek() {
            if let Some(img) = images.pop_wait(max_frametime) {
                let Ok(guard) = img.lock() else {
                    tracing::error!("captured image lock poisoned");
                    return Ok(());
                };
                frame_timestamp = guard.frame_timestamp;
                if session.convert(&guard).is_err() {
                    tracing::error!("could not convert image");
                    return Ok(());
                }
            } else if !images.running() {
                break;
            } else if !requested_idr_frame {
                // Nothing new to encode and no IDR pending
                continue;
            }
        }

        if session
            .encode(
                *frame_index,
                &events.packets,
                channel_data.clone(),
                frame_timestamp,
            )
            .is_err()
        {
            tracing::error!("could not encode video packet");
            return Ok(());
        }
        *frame_index += 1;

        session.request_normal_frame();
    }

    Ok(())
}
