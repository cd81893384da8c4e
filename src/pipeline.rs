//! Multi-display stream coordination
//!
//! One [`CaptureSession`] per monitor bundles a capture thread, an encode
//! thread and the session-scoped events. The coordinator spawns one bundle
//! per client monitor config, reacts to window-close events and tears the
//! bundles down on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capture::{
    capture_thread, display_slot, CaptureContext, DisplayBackend, DisplaySlot, SharedImage,
};
use crate::config::{ClientConfig, VideoSettings};
use crate::control;
use crate::encode::{encode_thread, EncoderDescriptor, ProbeOutcome};
use crate::events::{self, EventQueue, SessionEvents, StreamEvents};
use crate::types::{ChannelData, TouchPorts};

/// Capacity of the live-subscription queue feeding a capture thread
const CAPTURE_CONTEXT_QUEUE_DEPTH: usize = 30;

/// The threads, events and queues backing one streamed monitor
pub struct CaptureSession {
    pub session_index: i16,
    config: ClientConfig,
    ctx_queue: EventQueue<CaptureContext>,
    session_events: Arc<SessionEvents>,
    display_slot: DisplaySlot,
    encode_running: Arc<AtomicBool>,
    images: Option<EventQueue<SharedImage>>,
    capture_thread: Option<JoinHandle<()>>,
    encode_thread: Option<JoinHandle<()>>,
}

impl CaptureSession {
    pub fn new(session_index: i16) -> Self {
        Self {
            session_index,
            config: ClientConfig::default(),
            ctx_queue: EventQueue::bounded(CAPTURE_CONTEXT_QUEUE_DEPTH),
            session_events: Arc::new(SessionEvents::new()),
            display_slot: display_slot(),
            encode_running: Arc::new(AtomicBool::new(false)),
            images: None,
            capture_thread: None,
            encode_thread: None,
        }
    }

    /// Session-scoped events (IDR, switch-display, ref invalidation)
    pub fn session_events(&self) -> Arc<SessionEvents> {
        self.session_events.clone()
    }

    /// Subscribe an image consumer; the first subscription fixes the
    /// session's client config and index
    pub fn add_capture_context(&mut self, images: EventQueue<SharedImage>, config: ClientConfig) {
        self.session_index = config.display_index;
        self.config = config.clone();
        self.images = Some(images.clone());
        self.ctx_queue.raise(CaptureContext { images, config });
    }

    pub fn start_capture(
        &mut self,
        backend: Arc<dyn DisplayBackend>,
        encoder: Arc<EncoderDescriptor>,
        settings: Arc<VideoSettings>,
    ) {
        tracing::info!(session_index = self.session_index, "starting capture");
        self.session_events.reinit.reset();
        let ctx_queue = self.ctx_queue.clone();
        let slot = self.display_slot.clone();
        let session_events = self.session_events.clone();
        let session_index = self.session_index;
        self.capture_thread = Some(thread::spawn(move || {
            capture_thread(
                backend,
                ctx_queue,
                slot,
                session_events,
                encoder,
                settings,
                session_index,
            );
        }));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start_encode(
        &mut self,
        backend: Arc<dyn DisplayBackend>,
        events: StreamEvents,
        touch_ports: Arc<Mutex<TouchPorts>>,
        encoder: Arc<EncoderDescriptor>,
        settings: Arc<VideoSettings>,
        channel_data: Option<ChannelData>,
    ) {
        let Some(images) = self.images.clone() else {
            tracing::error!(
                session_index = self.session_index,
                "no capture context subscribed; encode not started"
            );
            return;
        };
        tracing::info!(session_index = self.session_index, "starting encode");
        self.encode_running.store(true, Ordering::SeqCst);

        let session_events = self.session_events.clone();
        let ctx_queue = self.ctx_queue.clone();
        let slot = self.display_slot.clone();
        let config = self.config.clone();
        let encode_running = self.encode_running.clone();
        self.encode_thread = Some(thread::spawn(move || {
            encode_thread(
                backend,
                events,
                session_events,
                ctx_queue,
                slot,
                encoder,
                settings,
                images,
                config,
                touch_ports,
                encode_running,
                channel_data,
            );
        }));
    }

    pub fn stop_capture(&mut self) {
        self.ctx_queue.stop();
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        tracing::info!(session_index = self.session_index, "capture stopped");
    }

    pub fn stop_encode(&mut self) {
        self.encode_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.encode_thread.take() {
            let _ = handle.join();
        }
        tracing::info!(session_index = self.session_index, "encode stopped");
    }

    fn shutdown(&mut self) {
        self.encode_running.store(false, Ordering::SeqCst);
        self.stop_capture();
        self.stop_encode();
    }
}

/// Run capture and encode for every configured monitor until shutdown
///
/// Blocks the calling thread; it polls for window-close events, tears down
/// the matching session pair and keeps the touch port union current.
pub fn run_capture(
    backend: Arc<dyn DisplayBackend>,
    events: StreamEvents,
    outcome: &ProbeOutcome,
    settings: Arc<VideoSettings>,
    configs: Vec<ClientConfig>,
    channel_data: Option<ChannelData>,
) {
    let touch_ports = Arc::new(Mutex::new(TouchPorts::default()));
    let mut sessions: Vec<CaptureSession> = Vec::new();

    for config in configs {
        let mut session = CaptureSession::new(config.display_index);
        session.add_capture_context(events::image_queue(), config);
        session.start_capture(
            backend.clone(),
            outcome.encoder.clone(),
            settings.clone(),
        );
        session.start_encode(
            backend.clone(),
            events.clone(),
            touch_ports.clone(),
            outcome.encoder.clone(),
            settings.clone(),
            channel_data.clone(),
        );
        sessions.push(session);
    }

    while !events.shutdown.peek() {
        if let Some(display_index) = events.close_window.pop() {
            tracing::info!(display_index, "window close requested");
            // With a single display the owning caller handles shutdown
            if sessions.len() > 1 {
                if let Some(pos) = sessions
                    .iter()
                    .position(|session| session.session_index == display_index)
                {
                    let mut session = sessions.remove(pos);
                    session.shutdown();

                    if let Ok(mut ports) = touch_ports.lock() {
                        control::remove_port(&mut ports, display_index);
                        events.touch_port.raise(ports.clone());
                    }
                    tracing::info!(display_index, "touch port union updated");
                }
            }
        }
        thread::sleep(Duration::from_millis(20));
    }

    for session in sessions.iter_mut() {
        session.shutdown();
    }
    // Anything still listening on this stream should stop too
    events.shutdown.raise();
    tracing::info!("all capture sessions stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::MockBackend;
    use crate::encode::{nvenc_native, probe_encoders, Registry};
    use crate::types::Packet;
    use std::time::Instant;

    fn wait_packets(
        events: &StreamEvents,
        count: usize,
        deadline: Duration,
    ) -> Vec<Packet> {
        let start = Instant::now();
        let mut packets = Vec::new();
        while packets.len() < count && start.elapsed() < deadline {
            if let Some(packet) = events.packets.pop_wait(Duration::from_millis(50)) {
                packets.push(packet);
            }
        }
        packets
    }

    fn probe(backend: &Arc<dyn DisplayBackend>) -> ProbeOutcome {
        let registry = Registry {
            encoders: vec![nvenc_native()],
        };
        probe_encoders(backend, registry, &VideoSettings::default(), None).unwrap()
    }

    #[test]
    fn test_single_display_stream() {
        let backend: Arc<dyn DisplayBackend> =
            Arc::new(MockBackend::with_displays(vec!["DP-1".into()]));
        let outcome = probe(&backend);
        let events = StreamEvents::new();
        let settings = Arc::new(VideoSettings::default());

        let coordinator = {
            let backend = backend.clone();
            let events = events.clone();
            let configs = vec![ClientConfig::default().with_display_index(0)];
            let outcome = outcome.clone();
            thread::spawn(move || {
                run_capture(backend, events, &outcome, settings, configs, None);
            })
        };

        let packets = wait_packets(&events, 120, Duration::from_secs(20));
        assert_eq!(packets.len(), 120);

        // Monotonic frame indices starting at 1, first packet is an IDR,
        // every packet stamped with the display index
        assert!(packets[0].idr);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.frame_index, i as i64 + 1);
            assert_eq!(packet.display_index, 0);
        }

        events.shutdown.raise();
        coordinator.join().unwrap();
    }

    #[test]
    fn test_close_one_of_two_windows() {
        let backend: Arc<dyn DisplayBackend> = Arc::new(MockBackend::with_displays(vec![
            "DP-1".into(),
            "DP-2".into(),
        ]));
        let outcome = probe(&backend);
        let events = StreamEvents::new();
        let settings = Arc::new(VideoSettings::default());

        let coordinator = {
            let backend = backend.clone();
            let events = events.clone();
            let configs = vec![
                ClientConfig::default().with_display_index(0),
                ClientConfig::default().with_display_index(1),
            ];
            let outcome = outcome.clone();
            thread::spawn(move || {
                run_capture(backend, events, &outcome, settings, configs, None);
            })
        };

        // Wait until both displays stream
        let start = Instant::now();
        let mut seen = [false, false];
        while !(seen[0] && seen[1]) && start.elapsed() < Duration::from_secs(20) {
            if let Some(packet) = events.packets.pop_wait(Duration::from_millis(50)) {
                seen[packet.display_index as usize] = true;
            }
        }
        assert!(seen[0] && seen[1]);

        events.close_window.raise(1);

        // The touch port union eventually contains only display 0
        let start = Instant::now();
        let mut ports = None;
        while start.elapsed() < Duration::from_secs(10) {
            while let Some(update) = events.touch_port.pop() {
                ports = Some(update);
            }
            if ports
                .as_ref()
                .is_some_and(|p| p.ports.len() == 1 && p.ports.contains_key(&0))
            {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let ports = ports.expect("touch ports published");
        assert_eq!(ports.ports.len(), 1);
        assert!(ports.ports.contains_key(&0));
        assert_eq!(ports.full, ports.ports[&0]);

        // Only display 0 keeps producing: drain, settle, then sample
        while events.packets.pop().is_some() {}
        thread::sleep(Duration::from_millis(200));
        while events.packets.pop().is_some() {}
        let packets = wait_packets(&events, 10, Duration::from_secs(10));
        assert!(!packets.is_empty());
        assert!(packets.iter().all(|p| p.display_index == 0));

        events.shutdown.raise();
        coordinator.join().unwrap();
    }

    #[test]
    fn test_switch_display_produces_idr() {
        let backend: Arc<dyn DisplayBackend> = Arc::new(MockBackend::with_displays(vec![
            "DP-1".into(),
            "DP-2".into(),
        ]));
        let outcome = probe(&backend);
        let events = StreamEvents::new();
        let settings = Arc::new(VideoSettings::default());

        let mut session = CaptureSession::new(0);
        let session_events = session.session_events();
        session.add_capture_context(
            events::image_queue(),
            ClientConfig::default().with_display_index(0),
        );
        let touch_ports = Arc::new(Mutex::new(TouchPorts::default()));
        session.start_capture(
            backend.clone(),
            outcome.encoder.clone(),
            settings.clone(),
        );
        session.start_encode(
            backend.clone(),
            events.clone(),
            touch_ports,
            outcome.encoder.clone(),
            settings,
            None,
        );

        // Stream some frames from display A
        let before = wait_packets(&events, 5, Duration::from_secs(10));
        assert_eq!(before.len(), 5);

        session_events.switch_display.raise(1);

        // The capture reinit rebuilds the session against display B; the
        // first post-switch packet is an IDR past the old frame counter
        let start = Instant::now();
        let mut post_switch_idr = None;
        while post_switch_idr.is_none() && start.elapsed() < Duration::from_secs(10) {
            if let Some(packet) = events.packets.pop_wait(Duration::from_millis(50)) {
                if packet.idr && packet.frame_index > 1 {
                    post_switch_idr = Some(packet);
                }
            }
        }
        let packet = post_switch_idr.expect("IDR after display switch");
        assert!(packet.frame_index > before.last().unwrap().frame_index);

        session.shutdown();
    }
}
