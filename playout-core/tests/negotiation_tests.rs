//! Integration tests for display mode negotiation and mode listing

mod mocks;

use playout_core::hardware::{Device, VirtualDeviceSpec, default_modes};
use playout_core::modes::{self, ModeRequest};
use playout_core::{
    Connection, DisplayModeNegotiator, FieldDominance, ModeListConfig, PixelFormat, PlayoutError,
};

fn request(width: u32, height: u32, fps: f64, formats: &[PixelFormat]) -> ModeRequest {
    ModeRequest {
        width,
        height,
        fps,
        pixel_formats: formats.to_vec(),
        connection: Connection::Sdi,
        keying: false,
    }
}

fn first_device(rig: &mocks::TestRig) -> Box<dyn Device> {
    rig.catalog.find_by_id(&rig.device_id).unwrap()
}

#[test]
fn test_priority_falls_through_to_supported_format() {
    // 1080p25 takes 8-bit YUV but not 10-bit
    let table = default_modes()
        .into_iter()
        .map(|m| {
            if m.name == "1080p25" {
                m.with_pixel_formats(&[PixelFormat::Yuv8, PixelFormat::Argb8])
            } else {
                m
            }
        })
        .collect();
    let rig = mocks::rig(VirtualDeviceSpec::default().with_modes(table));
    let device = first_device(&rig);
    let output = device.output().unwrap();

    let mode = DisplayModeNegotiator::new(output.as_ref())
        .negotiate(&request(1920, 1080, 25.0, &[PixelFormat::Yuv10, PixelFormat::Yuv8]))
        .unwrap();
    assert_eq!(mode.name.as_deref(), Some("1080p25"));
    assert_eq!(mode.pixel_format, PixelFormat::Yuv8);
    assert_eq!((mode.frame_duration, mode.time_scale), (1000, 25000));
}

#[test]
fn test_first_matching_mode_wins() {
    let rig = mocks::rig(VirtualDeviceSpec::default());
    let device = first_device(&rig);
    let output = device.output().unwrap();
    let negotiator = DisplayModeNegotiator::new(output.as_ref());

    // 1080i59.94 and 1080p29.97 share a frame rate; the interlaced one comes first
    let mode = negotiator
        .negotiate(&request(1920, 1080, 29.97, &[PixelFormat::Argb8]))
        .unwrap();
    assert_eq!(mode.name.as_deref(), Some("1080i59.94"));
    assert_eq!(mode.field_dominance, FieldDominance::UpperFieldFirst);

    // 30 is more than the tolerance away from 29.97
    let mode = negotiator
        .negotiate(&request(1920, 1080, 30.0, &[PixelFormat::Argb8]))
        .unwrap();
    assert_eq!(mode.name.as_deref(), Some("1080p30"));
    assert!((mode.fps() - 30.0).abs() < 1e-9);
}

#[test]
fn test_fps_tolerance() {
    let rig = mocks::rig(VirtualDeviceSpec::default());
    let device = first_device(&rig);
    let output = device.output().unwrap();
    let negotiator = DisplayModeNegotiator::new(output.as_ref());

    let mode = negotiator
        .negotiate(&request(1920, 1080, 23.98, &[PixelFormat::Bgra8]))
        .unwrap();
    assert_eq!(mode.name.as_deref(), Some("1080p23.98"));

    let err = negotiator
        .negotiate(&request(1920, 1080, 23.95, &[PixelFormat::Bgra8]))
        .unwrap_err();
    assert!(matches!(err, PlayoutError::NoDisplayMode { width: 1920, height: 1080, .. }));
}

#[test]
fn test_keying_excludes_yuv_formats() {
    let rig = mocks::rig(VirtualDeviceSpec::default());
    let device = first_device(&rig);
    let output = device.output().unwrap();

    let keyed = ModeRequest {
        keying: true,
        ..request(1920, 1080, 25.0, &[PixelFormat::Yuv10, PixelFormat::Bgra8])
    };
    let mode = DisplayModeNegotiator::new(output.as_ref()).negotiate(&keyed).unwrap();
    assert_eq!(mode.pixel_format, PixelFormat::Bgra8);
}

#[test]
fn test_connection_not_on_device() {
    let rig = mocks::rig(VirtualDeviceSpec {
        connections: vec![Connection::Hdmi],
        ..VirtualDeviceSpec::default()
    });
    let device = first_device(&rig);
    let output = device.output().unwrap();
    let err = DisplayModeNegotiator::new(output.as_ref())
        .negotiate(&request(1920, 1080, 25.0, &[PixelFormat::Argb8]))
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_list_modes_filters_and_rounds() {
    let rig = mocks::rig(VirtualDeviceSpec::default());
    let config = ModeListConfig::new(rig.device_id.clone(), format!("{}-sdi", rig.device_id))
        .with_size(1920, 1080)
        .with_fps(29.97);
    let listed = modes::list_modes(&rig.catalog, &config).unwrap();

    let names: Vec<&str> = listed.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["1080i59.94", "1080p29.97"]);
    assert_eq!(listed[1].fps, 29.97);
    assert_eq!(listed[1].frame_duration, 1001);
    assert_eq!(listed[1].connection, Connection::Sdi);
    assert_eq!(listed[1].pixel_formats, PixelFormat::ALL.to_vec());

    let json = serde_json::to_value(&listed[1]).unwrap();
    assert_eq!(json["fieldDominance"], "progressive");
    assert_eq!(json["timeScale"], 30000);
    assert_eq!(json["pixelFormats"][1], "10bit_yuv");
}

#[test]
fn test_list_modes_without_filters() {
    let rig = mocks::rig(VirtualDeviceSpec::default());
    let config = ModeListConfig::new(rig.device_id.clone(), format!("{}-hdmi", rig.device_id));
    let listed = modes::list_modes(&rig.catalog, &config).unwrap();
    assert_eq!(listed.len(), default_modes().len());
    assert!(listed.iter().all(|m| m.connection == Connection::Hdmi));
}

#[test]
fn test_list_modes_with_keying() {
    let rig = mocks::rig(VirtualDeviceSpec::default());
    let config = ModeListConfig::new(rig.device_id.clone(), format!("{}-sdi-a", rig.device_id))
        .with_size(720, 576)
        .with_keying(true);
    let listed = modes::list_modes(&rig.catalog, &config).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pixel_formats, vec![PixelFormat::Argb8, PixelFormat::Bgra8]);
}

#[test]
fn test_list_modes_port_errors() {
    let rig = mocks::rig(VirtualDeviceSpec::default());

    let missing = ModeListConfig::new(rig.device_id.clone(), "");
    assert!(matches!(
        modes::list_modes(&rig.catalog, &missing),
        Err(PlayoutError::Config(_))
    ));

    let other_device = ModeListConfig::new(rig.device_id.clone(), "decklink-other-sdi");
    assert!(matches!(
        modes::list_modes(&rig.catalog, &other_device),
        Err(PlayoutError::InvalidPort(_))
    ));

    let bad_suffix = ModeListConfig::new(rig.device_id.clone(), format!("{}-sdi-b", rig.device_id));
    assert!(matches!(
        modes::list_modes(&rig.catalog, &bad_suffix),
        Err(PlayoutError::InvalidPort(_))
    ));

    let unknown = ModeListConfig::new("decklink-gone", "decklink-gone-sdi");
    assert!(matches!(
        modes::list_modes(&rig.catalog, &unknown),
        Err(PlayoutError::DeviceNotFound(_))
    ));
}
