//! Stateless display orchestration helpers
//!
//! Display acquisition with retry, display list refresh that preserves the
//! active selection, and maintenance of the touch port union shared by all
//! active displays.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::capture::{Display, DisplayBackend};
use crate::config::{ClientConfig, VideoSettings};
use crate::types::{MemType, TouchPort, TouchPorts};

const DISPLAY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Open a display, retrying once after a short delay. The capture code
/// depends on the sleep between failures.
pub fn reset_display(
    backend: &dyn DisplayBackend,
    mem_type: MemType,
    display_name: &str,
    config: &ClientConfig,
) -> Option<Arc<dyn Display>> {
    for attempt in 0..2 {
        if let Some(disp) = backend.open_display(mem_type, display_name, config) {
            return Some(disp);
        }
        if attempt == 0 {
            thread::sleep(DISPLAY_RETRY_DELAY);
        }
    }
    tracing::error!(display = display_name, "could not acquire display");
    None
}

/// Update the display name list before or during a stream, keeping
/// `current_display_index` pointed at the same monitor when possible.
pub fn refresh_displays(
    backend: &dyn DisplayBackend,
    mem_type: MemType,
    settings: &VideoSettings,
    display_names: &mut Vec<String>,
    current_display_index: &mut i32,
) {
    // The output name may have gone empty since the last refresh (device
    // disconnected) or vice-versa
    let output_name = settings.output_name.clone();

    let current_display_name = usize::try_from(*current_display_index)
        .ok()
        .and_then(|idx| display_names.get(idx))
        .cloned();

    let old_display_names = std::mem::take(display_names);
    *display_names = backend.display_names(mem_type);

    if display_names.is_empty() && !old_display_names.is_empty() {
        tracing::error!("no displays were found after reenumeration");
        *display_names = old_display_names;
        return;
    } else if display_names.is_empty() {
        display_names.push(output_name.clone());
    }

    // New list, so start from the first display again
    *current_display_index = 0;

    if let Some(previous) = current_display_name {
        if let Some(idx) = display_names.iter().position(|name| *name == previous) {
            *current_display_index = idx as i32;
            return;
        }
        tracing::warn!(
            display = %previous,
            "previous active display is no longer present"
        );
    } else if let Some(idx) = display_names.iter().position(|name| *name == output_name) {
        *current_display_index = idx as i32;
    }
}

/// Insert (or refresh) the touch port for one display and rebuild the
/// union rectangle
pub fn make_port(touch_ports: &mut TouchPorts, display: &dyn Display, config: &ClientConfig) {
    let display_width = display.width() as f32;
    let display_height = display.height() as f32;

    let target_width = config.width;
    let target_height = config.height;

    // Letterboxed aspect-preserving fit of the display into the client
    // viewport
    let scalar = (target_width as f32 / display_width).min(target_height as f32 / display_height);
    let scaled_width = scalar * display_width;
    let scaled_height = scalar * display_height;

    let port = TouchPort {
        offset_x: display.offset_x(),
        offset_y: display.offset_y(),
        width: target_width,
        height: target_height,
        env_width: display.env_width(),
        env_height: display.env_height(),
        scale_offset_x: (target_width as f32 - scaled_width) * 0.5,
        scale_offset_y: (target_height as f32 - scaled_height) * 0.5,
        inverse_scalar: 1.0 / scalar,
    };

    touch_ports.ports.insert(config.display_index, port);
    touch_ports.recompute_full();
}

/// Remove one display's touch port and rebuild the union rectangle
pub fn remove_port(touch_ports: &mut TouchPorts, display_index: i16) {
    if touch_ports.ports.remove(&display_index).is_some() {
        touch_ports.recompute_full();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::{MockBackend, MockDisplay};
    use crate::types::TouchPort;

    #[test]
    fn test_refresh_keeps_selection_by_name() {
        let backend = MockBackend::with_displays(vec!["DP-1".into(), "DP-2".into(), "HDMI-1".into()]);
        let settings = VideoSettings::default();

        let mut names = vec!["DP-2".into(), "DP-1".into()];
        let mut index = 0; // DP-2
        refresh_displays(&backend, MemType::System, &settings, &mut names, &mut index);
        assert_eq!(names, vec!["DP-1", "DP-2", "HDMI-1"]);
        assert_eq!(index, 1);
    }

    #[test]
    fn test_refresh_falls_back_when_display_gone() {
        let backend = MockBackend::with_displays(vec!["DP-1".into()]);
        let settings = VideoSettings::default();

        let mut names = vec!["DP-1".into(), "DP-9".into()];
        let mut index = 1; // DP-9, about to vanish
        refresh_displays(&backend, MemType::System, &settings, &mut names, &mut index);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_refresh_keeps_old_list_when_enumeration_fails() {
        let backend = MockBackend::with_displays(vec![]);
        let settings = VideoSettings::default();

        let mut names = vec!["DP-1".into()];
        let mut index = 0;
        refresh_displays(&backend, MemType::System, &settings, &mut names, &mut index);
        assert_eq!(names, vec!["DP-1"]);
    }

    #[test]
    fn test_refresh_seeds_configured_name_when_both_empty() {
        let backend = MockBackend::with_displays(vec![]);
        let settings = VideoSettings {
            output_name: "VDD-1".into(),
            ..Default::default()
        };

        let mut names = Vec::new();
        let mut index = -1;
        refresh_displays(&backend, MemType::System, &settings, &mut names, &mut index);
        assert_eq!(names, vec!["VDD-1"]);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_refresh_prefers_configured_output_name() {
        let backend = MockBackend::with_displays(vec!["DP-1".into(), "DP-2".into()]);
        let settings = VideoSettings {
            output_name: "DP-2".into(),
            ..Default::default()
        };

        let mut names = Vec::new();
        let mut index = -1;
        refresh_displays(&backend, MemType::System, &settings, &mut names, &mut index);
        assert_eq!(index, 1);
    }

    #[test]
    fn test_make_port_letterboxes_wide_display() {
        // 1920x1080 client viewport showing a 2560x1080 display: width
        // limited, vertical letterbox bars
        let display = MockDisplay::with_geometry(2560, 1080, 0, 0, 2560, 1080);
        let config = ClientConfig::default();
        let mut ports = TouchPorts::default();
        make_port(&mut ports, &display, &config);

        let port = ports.ports.get(&0).unwrap();
        assert_eq!(port.width, 1920);
        assert_eq!(port.height, 1080);
        let expected_scalar = 1920.0 / 2560.0;
        assert!((port.inverse_scalar - 1.0 / expected_scalar).abs() < f32::EPSILON);
        assert!(port.scale_offset_x.abs() < f32::EPSILON);
        let expected_offset_y = (1080.0 - 1080.0 * expected_scalar) * 0.5;
        assert!((port.scale_offset_y - expected_offset_y).abs() < 0.001);

        // First port becomes the full union
        assert_eq!(ports.full.width, 1920);
    }

    #[test]
    fn test_port_union_across_two_displays() {
        let left = MockDisplay::with_geometry(1920, 1080, 0, 0, 3840, 1080);
        let right = MockDisplay::with_geometry(1920, 1080, 1920, 0, 3840, 1080);
        let mut ports = TouchPorts::default();

        make_port(&mut ports, &left, &ClientConfig::default().with_display_index(0));
        make_port(&mut ports, &right, &ClientConfig::default().with_display_index(1));

        assert_eq!(ports.full.offset_x, 0);
        assert_eq!(ports.full.width, 3840);
        assert_eq!(ports.full.height, 1080);

        remove_port(&mut ports, 1);
        assert_eq!(ports.ports.len(), 1);
        assert_eq!(ports.full.width, 1920);

        remove_port(&mut ports, 0);
        assert_eq!(ports.full, TouchPort::default());
    }

    #[test]
    fn test_remove_port_unknown_index_is_noop() {
        let display = MockDisplay::with_geometry(1920, 1080, 0, 0, 1920, 1080);
        let mut ports = TouchPorts::default();
        make_port(&mut ports, &display, &ClientConfig::default());
        let before = ports.full;
        remove_port(&mut ports, 7);
        assert_eq!(ports.full, before);
    }
}
