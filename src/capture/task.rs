//! Per-display capture task
//!
//! Owns the display handle and the image pool. Captured frames are fanned
//! out to every subscribed encode context; on device loss the task rebuilds
//! the display in place and the encode side waits on the reinit signal.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::capture::{
    CaptureStatus, CursorConfig, Display, DisplayBackend, DisplaySlot, ImagePool, SharedImage,
    ThreadPriority,
};
use crate::capture::pool::DEFAULT_POOL_CAPACITY;
use crate::config::{ClientConfig, VideoSettings};
use crate::control;
use crate::encode::EncoderDescriptor;
use crate::events::{EventQueue, SessionEvents};
use crate::types::MemType;

/// One encode subscriber of a capture task
pub struct CaptureContext {
    pub images: EventQueue<SharedImage>,
    pub config: ClientConfig,
}

/// Capture task entry point, run on a dedicated OS thread
pub fn capture_thread(
    backend: Arc<dyn DisplayBackend>,
    ctx_queue: EventQueue<CaptureContext>,
    display_slot: DisplaySlot,
    events: Arc<SessionEvents>,
    encoder: Arc<EncoderDescriptor>,
    settings: Arc<VideoSettings>,
    display_index: i16,
) {
    tracing::debug!(display_index, "capture task starting");
    let mut capture_ctxs: Vec<CaptureContext> = Vec::new();

    run(
        &backend,
        &ctx_queue,
        &display_slot,
        &events,
        &encoder,
        &settings,
        display_index,
        &mut capture_ctxs,
    );

    // Stop every subscriber listening to this task, including ones that
    // were queued but never picked up
    ctx_queue.stop();
    for ctx in &capture_ctxs {
        ctx.images.stop();
    }
    while let Some(ctx) = ctx_queue.pop() {
        ctx.images.stop();
    }
    tracing::debug!(display_index, "capture task stopped");
}

#[allow(clippy::too_many_arguments)]
fn run(
    backend: &Arc<dyn DisplayBackend>,
    ctx_queue: &EventQueue<CaptureContext>,
    display_slot: &DisplaySlot,
    events: &Arc<SessionEvents>,
    encoder: &Arc<EncoderDescriptor>,
    settings: &Arc<VideoSettings>,
    display_index: i16,
    capture_ctxs: &mut Vec<CaptureContext>,
) -> Option<()> {
    let mem_type = encoder.formats.mem_type();

    // Wait for the initial capture context or a request to stop the queue
    let initial_ctx = loop {
        if !ctx_queue.running() {
            return None;
        }
        if let Some(ctx) = ctx_queue.pop_wait(Duration::from_millis(100)) {
            break ctx;
        }
    };
    capture_ctxs.push(initial_ctx);

    // Enumerate now rather than at boot to get the freshest monitor list
    let mut display_names = backend.display_names(mem_type);
    let mut current_display_index = display_index as i32;
    control::refresh_displays(
        backend.as_ref(),
        mem_type,
        settings,
        &mut display_names,
        &mut current_display_index,
    );
    if display_names.is_empty() {
        tracing::error!(display_index, "no displays available for capture");
        return None;
    }
    let mut current_display_name =
        display_names[current_display_index.clamp(0, display_names.len() as i32 - 1) as usize].clone();

    let config = capture_ctxs[0].config.clone();
    let mut disp = control::reset_display(backend.as_ref(), mem_type, &current_display_name, &config)?;
    publish(display_slot, &disp);
    tracing::debug!(display_index, display = %current_display_name, "display acquired");

    let mut pool = ImagePool::new(DEFAULT_POOL_CAPACITY);
    let cursor = CursorConfig::default();

    backend.adjust_thread_priority(ThreadPriority::Critical);

    while ctx_queue.running() {
        let mut artificial_reinit = false;

        let mut status = {
            let disp_for_pull = &disp;
            let mut pull = || -> Option<SharedImage> {
                while ctx_queue.running() {
                    match pool.pull(&mut || disp_for_pull.alloc_img()) {
                        Ok(Some(img)) => return Some(img),
                        Ok(None) => thread::sleep(Duration::from_millis(1)),
                        Err(e) => {
                            tracing::error!("image allocation failed: {}", e);
                            return None;
                        }
                    }
                }
                None
            };

            let mut push = |img: SharedImage, frame_captured: bool| -> bool {
                capture_ctxs.retain(|ctx| ctx.images.running());
                if frame_captured {
                    for ctx in capture_ctxs.iter() {
                        ctx.images.raise(img.clone());
                    }
                }

                if !ctx_queue.running() {
                    return false;
                }

                // Pick up subscribers added while capturing
                while let Some(ctx) = ctx_queue.pop() {
                    capture_ctxs.push(ctx);
                }

                if events.switch_display.peek() {
                    artificial_reinit = true;
                    return false;
                }

                true
            };

            disp.capture(&mut push, &mut pull, &cursor)
        };

        if artificial_reinit && status != CaptureStatus::Error {
            status = CaptureStatus::Reinit;
        }

        match status {
            CaptureStatus::Reinit => {
                tracing::debug!(display_index, "capture device lost, reinitializing");
                events.reinit.raise();

                // Pooled images can reference backend resources tied to the
                // display; they must go before the display can be released
                pool.clear();

                // Wait until this task holds the only strong reference.
                // Frames the encoders never consumed keep the display alive,
                // so drain the subscriber queues here rather than racing the
                // encode threads for them.
                while Arc::strong_count(&disp) > 1 {
                    capture_ctxs.retain(|ctx| ctx.images.running());
                    for ctx in capture_ctxs.iter() {
                        while ctx.images.pop().is_some() {}
                    }
                    thread::sleep(Duration::from_millis(20));
                }

                disp = rebuild_display(
                    backend,
                    ctx_queue,
                    events,
                    disp,
                    mem_type,
                    settings,
                    &mut display_names,
                    &mut current_display_name,
                    &config,
                    display_index,
                )?;

                publish(display_slot, &disp);
                tracing::debug!(display_index, display = %current_display_name, "display reacquired");
                events.reinit.reset();
            }
            CaptureStatus::Ok => {}
            CaptureStatus::Timeout | CaptureStatus::Interrupted | CaptureStatus::Error => {
                tracing::debug!(display_index, ?status, "capture loop ended");
                return None;
            }
        }
    }

    Some(())
}

fn publish(slot: &DisplaySlot, disp: &Arc<dyn Display>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(Arc::downgrade(disp));
    }
}

/// Release the lost display and construct a replacement, honoring a pending
/// switch-display request. Returns `None` only when the task is stopping.
#[allow(clippy::too_many_arguments)]
fn rebuild_display(
    backend: &Arc<dyn DisplayBackend>,
    ctx_queue: &EventQueue<CaptureContext>,
    events: &Arc<SessionEvents>,
    disp: Arc<dyn Display>,
    mem_type: MemType,
    settings: &Arc<VideoSettings>,
    display_names: &mut Vec<String>,
    current_display_name: &mut String,
    config: &ClientConfig,
    display_index: i16,
) -> Option<Arc<dyn Display>> {
    // Some capture backends only support a single display session per
    // device, so release ours before reenumerating
    drop(disp);

    while ctx_queue.running() {
        let mut new_display_names = backend.display_names(mem_type);
        while ctx_queue.running() && new_display_names.is_empty() {
            // Wait for the lost device set to come back
            thread::sleep(Duration::from_millis(20));
            new_display_names = backend.display_names(mem_type);
        }
        if !ctx_queue.running() {
            return None;
        }

        let mut new_index = new_display_names
            .iter()
            .position(|name| name == current_display_name)
            .map(|i| i as i32)
            .unwrap_or(-1);
        *display_names = new_display_names;

        if new_index == -1 {
            // The previous monitor is gone; pick a usable replacement
            control::refresh_displays(
                backend.as_ref(),
                mem_type,
                settings,
                display_names,
                &mut new_index,
            );
        }

        if let Some(requested) = events.switch_display.pop() {
            new_index = requested.clamp(0, display_names.len() as i32 - 1);
            tracing::info!(
                display_index,
                requested,
                new_index,
                "applying pending display switch"
            );
        }

        if display_names.is_empty() {
            continue;
        }
        *current_display_name =
            display_names[new_index.clamp(0, display_names.len() as i32 - 1) as usize].clone();

        if let Some(new_disp) =
            control::reset_display(backend.as_ref(), mem_type, current_display_name, config)
        {
            return Some(new_disp);
        }
    }

    None
}
