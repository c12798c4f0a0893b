//! Integration tests for error handling

use playout_core::error::{PlayoutError, ResultExt};
use playout_core::hardware::HwError;

#[test]
fn test_error_context_chaining() {
    let base_error = PlayoutError::framebus("slot count is zero");
    let with_context = base_error.with_context("Opening frame bus playout-main");

    let msg = format!("{}", with_context);
    assert!(msg.contains("Opening frame bus playout-main"));
    assert!(msg.contains("slot count is zero"));
}

#[test]
fn test_error_context_preserves_hint() {
    let base_error = PlayoutError::DeviceNotFound("decklink-pid-9".to_string());
    let hint_before = base_error.user_hint();
    assert!(hint_before.is_some());

    let with_context = base_error.with_context("Resolving playback device");
    assert_eq!(with_context.user_hint(), hint_before);
}

#[test]
fn test_result_ext_context() {
    let result: Result<(), PlayoutError> = Err(PlayoutError::config("width is zero"));
    let with_context = result.context("Validating playback request");

    let err = with_context.unwrap_err();
    assert!(err.to_string().starts_with("Validating playback request: "));
    assert!(err.is_configuration());
}

#[test]
fn test_configuration_errors_are_classified() {
    let configuration = [
        PlayoutError::config("bad"),
        PlayoutError::UnknownPixelFormat("12bit".to_string()),
        PlayoutError::InvalidPort("x".to_string()),
        PlayoutError::DeviceNotFound("x".to_string()),
        PlayoutError::NoDisplayMode {
            width: 1920,
            height: 1080,
            fps: 25.0,
        },
        PlayoutError::KeyingUnsupported("x".to_string()),
        PlayoutError::framebus("size mismatch"),
    ];
    for err in &configuration {
        assert!(err.is_configuration(), "{} should be a configuration error", err);
    }

    let runtime = [
        PlayoutError::hardware("StartScheduledPlayback", HwError::Busy),
        PlayoutError::unsupported("virtual clock"),
        PlayoutError::Io(std::io::Error::other("pipe closed")),
    ];
    for err in &runtime {
        assert!(!err.is_configuration(), "{} should not be a configuration error", err);
    }
}

#[test]
fn test_hardware_error_names_operation() {
    let err = PlayoutError::hardware("EnableVideoOutput", HwError::Busy);
    assert!(err.to_string().starts_with("EnableVideoOutput failed: "));
    assert!(std::error::Error::source(&err).is_some());
    assert!(err.user_hint().is_none());
}

#[test]
fn test_toml_errors_become_config_errors() {
    let parsed: Result<toml::Value, _> = toml::from_str("[broken");
    let err: PlayoutError = parsed.unwrap_err().into();
    assert!(matches!(err, PlayoutError::Config(ref msg) if msg.starts_with("Failed to parse config file")));
}
