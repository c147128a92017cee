//! Feature control through the acquisition engine: verified writes, auto
//! modes, layout changes and settings files.

mod common;

use std::time::Duration;

use common::{camera_config, camera_rig, camera_rig_with, drain, wait_until, CAMERA_ID};
use tosca_daq::camera::{FeatureName, FeatureValue, FeatureWarning, PixelFormat, SettingsDocument};
use tosca_daq::diagnostics::Diagnostic;
use tosca_daq::hardware::mock::MockCameraSpec;
use tosca_daq::DaqError;

fn initialized() -> common::CameraRig {
    let rig = camera_rig(camera_config());
    rig.engine.initialize().expect("initialize");
    rig
}

#[test]
fn test_list_features_describes_access_and_ranges() {
    let rig = initialized();
    let features = rig.engine.list_features().expect("list");

    let exposure = features
        .iter()
        .find(|d| d.name == FeatureName::ExposureTime)
        .expect("ExposureTime published");
    assert_eq!((exposure.min, exposure.max), (Some(10.0), Some(1_000_000.0)));
    assert_eq!(exposure.unit.as_deref(), Some("us"));
    assert!(exposure.access.is_writable());

    let temperature = features
        .iter()
        .find(|d| d.name == FeatureName::DeviceTemperature)
        .expect("DeviceTemperature published");
    assert!(temperature.access.is_readable());
    assert!(!temperature.access.is_writable());
}

#[test]
fn test_in_range_write_is_applied() {
    let rig = initialized();
    let write = rig
        .engine
        .set_feature(&FeatureName::ExposureTime, FeatureValue::Float(5000.0))
        .expect("write");
    assert!(write.is_applied());
    assert_eq!(write.actual, FeatureValue::Float(5000.0));
    assert_eq!(
        rig.engine.get_feature(&FeatureName::ExposureTime).expect("read"),
        FeatureValue::Float(5000.0)
    );
}

#[test]
fn test_integer_is_widened_for_float_feature() {
    let rig = initialized();
    let write = rig
        .engine
        .set_feature(&FeatureName::Gain, FeatureValue::Int(6))
        .expect("write");
    assert_eq!(write.requested, FeatureValue::Float(6.0));
    assert!(write.is_applied());
}

#[test]
fn test_value_within_increment_is_accepted() {
    let rig = initialized();
    let write = rig
        .engine
        .set_feature(&FeatureName::Gain, FeatureValue::Float(3.04))
        .expect("write");
    assert!(write.is_applied(), "device rounds to its 0.1 dB increment");
}

#[test]
fn test_clamped_write_warns_but_succeeds() {
    let rig = initialized();
    let mut diagnostics = rig.diagnostics.subscribe();
    let write = rig
        .engine
        .set_feature(&FeatureName::ExposureTime, FeatureValue::Float(2.0))
        .expect("clamped write still succeeds");

    assert_eq!(write.actual, FeatureValue::Float(10.0));
    assert_eq!(
        write.warning,
        Some(FeatureWarning::ValueNotApplied {
            feature: FeatureName::ExposureTime,
            requested: FeatureValue::Float(2.0),
            actual: FeatureValue::Float(10.0),
        })
    );
    assert!(drain(&mut diagnostics).iter().any(|d| matches!(
        d,
        Diagnostic::ValueNotApplied { device_id, feature, .. }
            if device_id == CAMERA_ID && feature == "ExposureTime"
    )));
}

#[test]
fn test_write_errors() {
    let rig = initialized();
    assert!(matches!(
        rig.engine
            .set_feature(&FeatureName::DeviceTemperature, FeatureValue::Float(20.0)),
        Err(DaqError::FeatureNotWritable(_))
    ));
    assert!(matches!(
        rig.engine.set_feature(&FeatureName::Gain, FeatureValue::Bool(true)),
        Err(DaqError::FeatureTypeMismatch { expected: "float", .. })
    ));
    assert!(matches!(
        rig.engine
            .set_feature(&FeatureName::from("Unobtainium"), FeatureValue::Int(1)),
        Err(DaqError::UnknownFeature(_))
    ));
    assert!(matches!(
        rig.engine.get_feature(&FeatureName::OffsetX),
        Err(DaqError::UnknownFeature(_))
    ));
    assert!(matches!(
        rig.engine
            .set_feature(&FeatureName::ExposureAuto, FeatureValue::from("Sometimes")),
        Err(DaqError::Hardware(_))
    ));
}

#[test]
fn test_auto_mode_takes_over_exposure() {
    let rig = initialized();
    let write = rig.engine.set_auto(&FeatureName::ExposureAuto, true).expect("enable");
    assert_eq!(write.actual, FeatureValue::from("Continuous"));
    assert!(write.is_applied());

    // The camera ignores manual exposure while auto is on.
    let ignored = rig
        .engine
        .set_feature(&FeatureName::ExposureTime, FeatureValue::Float(20_000.0))
        .expect("write");
    assert!(!ignored.is_applied());
    assert_eq!(ignored.actual, FeatureValue::Float(10_000.0));

    rig.engine.set_auto(&FeatureName::ExposureAuto, false).expect("disable");
    assert_eq!(
        rig.engine.get_feature(&FeatureName::ExposureAuto).expect("read"),
        FeatureValue::from("Off")
    );
    assert!(rig
        .engine
        .set_feature(&FeatureName::ExposureTime, FeatureValue::Float(20_000.0))
        .expect("write")
        .is_applied());
}

#[test]
fn test_auto_mode_falls_back_to_on() {
    let spec = MockCameraSpec::new(CAMERA_ID).with_auto_entries(&["Off", "On"]);
    let rig = camera_rig_with(spec, camera_config());
    rig.engine.initialize().expect("initialize");
    let mut diagnostics = rig.diagnostics.subscribe();

    let write = rig.engine.set_auto(&FeatureName::GainAuto, true).expect("enable");
    assert_eq!(write.actual, FeatureValue::from("On"));
    assert!(write.is_applied());
    assert!(drain(&mut diagnostics).contains(&Diagnostic::AutoModeFallback {
        device_id: CAMERA_ID.to_string(),
        feature: "GainAuto".to_string(),
        value: "On".to_string(),
    }));
}

#[test]
fn test_set_auto_on_non_enum_feature_is_rejected() {
    let rig = initialized();
    assert!(matches!(
        rig.engine.set_auto(&FeatureName::Gain, true),
        Err(DaqError::FeatureTypeMismatch { expected: "enum", .. })
    ));
}

#[test]
fn test_layout_changes_resize_frames() {
    let rig = initialized();
    rig.engine
        .set_feature(&FeatureName::Width, FeatureValue::Int(32))
        .expect("width");
    let geometry = rig.engine.geometry().expect("geometry");
    assert_eq!((geometry.width, geometry.height), (32, 48));

    let selection = rig.engine.set_pixel_format(PixelFormat::Rgb8).expect("format");
    assert!(!selection.is_substitution());
    assert_eq!(rig.engine.pixel_format().expect("format"), PixelFormat::Rgb8);
    let frame = rig.engine.capture_single().expect("capture");
    assert_eq!(frame.byte_len(), 32 * 48 * 3);
    assert_eq!(frame.channel_count, 3);
}

#[test]
fn test_undisplayable_format_request_falls_back() {
    let rig = initialized();
    let mut diagnostics = rig.diagnostics.subscribe();
    let selection = rig.engine.set_pixel_format(PixelFormat::Mono12).expect("format");
    assert_eq!(selection.selected, PixelFormat::Mono8);
    assert!(drain(&mut diagnostics)
        .iter()
        .any(|d| matches!(d, Diagnostic::FormatSubstituted { requested: PixelFormat::Mono12, .. })));
    let advertised = rig.engine.available_pixel_formats().expect("formats");
    assert_eq!(advertised.len(), 4);
    assert!(advertised.iter().any(|d| d.format == PixelFormat::Mono12 && !d.is_display_compatible));
}

#[test]
fn test_layout_locked_while_streaming() {
    let rig = initialized();
    rig.engine.start_streaming().expect("start");
    assert!(wait_until(Duration::from_secs(2), || rig.engine.get_current_frame().is_some()));

    assert!(matches!(
        rig.engine.set_feature(&FeatureName::Height, FeatureValue::Int(16)),
        Err(DaqError::InvalidState(_))
    ));
    assert!(matches!(
        rig.engine.set_pixel_format(PixelFormat::Bgr8),
        Err(DaqError::InvalidState(_))
    ));
    // Non-layout features stay writable.
    rig.engine
        .set_feature(&FeatureName::Gain, FeatureValue::Float(2.0))
        .expect("gain while streaming");
    rig.engine.stop_streaming().expect("stop");
}

#[test]
fn test_settings_round_trip() {
    let rig = initialized();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("camera.toml");

    rig.engine
        .set_feature(&FeatureName::Gain, FeatureValue::Float(6.0))
        .expect("gain");
    rig.engine
        .set_feature(&FeatureName::ReverseX, FeatureValue::Bool(true))
        .expect("reverse");
    rig.engine.set_pixel_format(PixelFormat::Bgr8).expect("format");
    let saved = rig.engine.save_settings(&path).expect("save");

    let document = SettingsDocument::from_toml(&std::fs::read_to_string(&path).expect("read"))
        .expect("parse");
    assert_eq!(saved, document.features.len());
    assert_eq!(document.device.id, CAMERA_ID);
    assert!(!document.features.contains_key("DeviceTemperature"));
    assert_eq!(document.features.get("PixelFormat"), Some(&FeatureValue::from("Bgr8")));

    rig.engine
        .set_feature(&FeatureName::Gain, FeatureValue::Float(0.0))
        .expect("gain");
    rig.engine
        .set_feature(&FeatureName::ReverseX, FeatureValue::Bool(false))
        .expect("reverse");
    rig.engine.set_pixel_format(PixelFormat::Mono8).expect("format");

    let report = rig.engine.load_settings(&path).expect("load");
    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    assert_eq!(report.warnings().count(), 0);
    assert!(report.touched(&FeatureName::Gain));
    assert_eq!(report.applied[0].name, FeatureName::PixelFormat);

    let gain = rig
        .engine
        .get_feature(&FeatureName::Gain)
        .expect("read")
        .as_f64()
        .expect("numeric");
    assert!((gain - 6.0).abs() < 1e-9);
    assert_eq!(
        rig.engine.get_feature(&FeatureName::ReverseX).expect("read"),
        FeatureValue::Bool(true)
    );
    assert_eq!(rig.engine.pixel_format().expect("format"), PixelFormat::Bgr8);
}

#[test]
fn test_load_skips_unknown_and_records_failures() {
    let rig = initialized();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("edited.toml");
    std::fs::write(
        &path,
        r#"
saved_at = "2024-05-01T12:00:00Z"

[device]
id = "DEV_OTHER"
model = "Mako G-040"
serial = "50-0503"

[features]
DeviceTemperature = 20.0
Gamma = 1.5
GainAuto = "Sometimes"
Unobtainium = 3
"#,
    )
    .expect("write");

    let report = rig.engine.load_settings(&path).expect("load");
    assert!(report.skipped.contains(&"Unobtainium".to_string()));
    assert!(report.skipped.contains(&"DeviceTemperature".to_string()));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "GainAuto");
    assert!(report.touched(&FeatureName::Gamma));
    assert_eq!(
        rig.engine.get_feature(&FeatureName::Gamma).expect("read"),
        FeatureValue::Float(1.5)
    );
}

#[test]
fn test_load_rejected_while_streaming() {
    let rig = initialized();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("camera.toml");
    rig.engine.save_settings(&path).expect("save");

    rig.engine.start_streaming().expect("start");
    assert!(matches!(rig.engine.load_settings(&path), Err(DaqError::InvalidState(_))));
    rig.engine.stop_streaming().expect("stop");
    rig.engine.load_settings(&path).expect("load once stopped");
}

#[test]
fn test_malformed_settings_file_is_an_error() {
    let rig = initialized();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "features = [not toml").expect("write");
    assert!(matches!(rig.engine.load_settings(&path), Err(DaqError::TomlDe(_))));
    assert!(matches!(
        rig.engine.load_settings(&dir.path().join("missing.toml")),
        Err(DaqError::Io(_))
    ));
}
