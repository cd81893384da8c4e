//! Codec option application
//!
//! Options are applied in strict list order so later entries override
//! earlier ones: common, then SDR/HDR, then the 4:4:4 overlays, then the
//! fallback set on the retry attempt.

use ffmpeg_next::Dictionary;

use crate::config::{ChromaSampling, ClientConfig, VideoSettings};
use crate::encode::{CodecSupport, EncoderOption, OptionValue};

/// Append one option list to the dictionary
pub fn apply_options(
    dict: &mut Dictionary,
    options: &[EncoderOption],
    settings: &VideoSettings,
    config: &ClientConfig,
) {
    for option in options {
        match &option.value {
            OptionValue::Int(v) => dict.set(option.name, &v.to_string()),
            OptionValue::Str(v) => dict.set(option.name, v),
            OptionValue::SettingsInt(f) => dict.set(option.name, &f(settings).to_string()),
            OptionValue::SettingsOptInt(f) => {
                if let Some(v) = f(settings) {
                    dict.set(option.name, &v.to_string());
                }
            }
            OptionValue::SettingsStr(f) => {
                let v = f(settings);
                if !v.is_empty() {
                    dict.set(option.name, &v);
                }
            }
            OptionValue::ClientStr(f) => dict.set(option.name, &f(config)),
        }
    }
}

/// Build the full option dictionary for one session construction attempt
pub fn build_options(
    support: &CodecSupport,
    settings: &VideoSettings,
    config: &ClientConfig,
    use_fallback: bool,
) -> Dictionary<'static> {
    let mut dict = Dictionary::new();

    apply_options(&mut dict, &support.common_options, settings, config);
    let tier = if config.dynamic_range {
        &support.hdr_options
    } else {
        &support.sdr_options
    };
    apply_options(&mut dict, tier, settings, config);

    if config.chroma_sampling == ChromaSampling::Cs444 {
        let tier = if config.dynamic_range {
            &support.hdr444_options
        } else {
            &support.sdr444_options
        };
        apply_options(&mut dict, tier, settings, config);
    }

    if use_fallback {
        apply_options(&mut dict, &support.fallback_options, settings, config);
    }

    dict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoFormat;
    use crate::encode::{quicksync, software};

    #[test]
    fn test_later_options_override_earlier() {
        let support = CodecSupport {
            common_options: vec![EncoderOption::int("low_power", 1)],
            fallback_options: vec![EncoderOption::int("low_power", 0)],
            ..Default::default()
        };
        let settings = VideoSettings::default();
        let config = ClientConfig::default();

        let dict = build_options(&support, &settings, &config, false);
        assert_eq!(dict.get("low_power"), Some("1"));

        let dict = build_options(&support, &settings, &config, true);
        assert_eq!(dict.get("low_power"), Some("0"));
    }

    #[test]
    fn test_hdr_profile_overlay() {
        let qsv = quicksync();
        let settings = VideoSettings::default();
        let mut config = ClientConfig::default().with_video_format(VideoFormat::Hevc);

        let dict = build_options(&qsv.hevc, &settings, &config, false);
        assert_eq!(dict.get("profile"), Some("1"));

        config.dynamic_range = true;
        let dict = build_options(&qsv.hevc, &settings, &config, false);
        assert_eq!(dict.get("profile"), Some("2"));

        config.chroma_sampling = ChromaSampling::Cs444;
        let dict = build_options(&qsv.hevc, &settings, &config, false);
        // RExt overrides the Main 10 profile from the HDR tier
        assert_eq!(dict.get("profile"), Some("4"));
    }

    #[test]
    fn test_settings_string_options() {
        let sw = software();
        let settings = VideoSettings::default();
        let config = ClientConfig::default();

        let dict = build_options(&sw.h264, &settings, &config, false);
        assert_eq!(dict.get("preset"), Some("superfast"));
        assert_eq!(dict.get("tune"), Some("zerolatency"));
    }

    #[test]
    fn test_client_producer_option() {
        let amd = crate::encode::amdvce();
        let settings = VideoSettings::default();

        // 1080p60 sits under the level 5.1 pixel rate
        let config = ClientConfig::default();
        let dict = build_options(&amd.hevc, &settings, &config, false);
        assert_eq!(dict.get("level"), Some("5.1"));

        // 4K120 fits level 5.2 but not 5.1
        let config = ClientConfig::default()
            .with_resolution(3840, 2160)
            .with_framerate(120);
        let dict = build_options(&amd.hevc, &settings, &config, false);
        assert_eq!(dict.get("level"), Some("5.2"));

        // 4K144 exceeds both pixel-rate thresholds
        let config = ClientConfig::default()
            .with_resolution(3840, 2160)
            .with_framerate(144);
        let dict = build_options(&amd.hevc, &settings, &config, false);
        assert_eq!(dict.get("level"), Some("auto"));
    }
}
