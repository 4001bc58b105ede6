//! Integration tests for error handling

use livecast_core::error::{LivecastError, ResultExt};

#[test]
fn test_error_context_chaining() {
    let base_error = LivecastError::prepare("No encoder accepts 7680x4320");
    let with_context = base_error.with_context("Preparing video");

    let msg = format!("{}", with_context);
    assert!(msg.contains("Preparing video"));
    assert!(msg.contains("No encoder accepts"));
}

#[test]
fn test_error_context_preserves_hint() {
    let base_error = LivecastError::connection("Connection refused");
    let hint_before = base_error.user_hint();

    let with_context = base_error.with_context("Starting stream");
    assert_eq!(hint_before, with_context.user_hint());
}

#[test]
fn test_result_ext_context() {
    let result: Result<(), LivecastError> = Err(LivecastError::record_io("Permission denied"));
    let err = result.context("Starting recording").unwrap_err();

    let msg = format!("{}", err);
    assert!(msg.contains("Starting recording"));
    assert!(matches!(err.root(), LivecastError::RecordIo(_)));
}

#[test]
fn test_user_hints() {
    let err = LivecastError::connection("test");
    assert!(err.user_hint().unwrap().contains("stream URL"));

    let err = LivecastError::auth("test");
    assert!(err.user_hint().unwrap().contains("password"));

    let err = LivecastError::record_io("test");
    assert!(err.user_hint().unwrap().contains("writable"));

    let err = LivecastError::config("test");
    assert!(err.user_hint().unwrap().contains("config.toml"));

    assert!(LivecastError::codec("test").user_hint().is_none());
}

#[test]
fn test_user_recoverable() {
    assert!(LivecastError::prepare("test").is_user_recoverable());
    assert!(LivecastError::connection("test").is_user_recoverable());
    assert!(LivecastError::auth("test").is_user_recoverable());
    assert!(LivecastError::device_open("test").is_user_recoverable());

    assert!(!LivecastError::codec("test").is_user_recoverable());
    assert!(!LivecastError::send("test").is_user_recoverable());
    assert!(!LivecastError::invalid_state("test").is_user_recoverable());
    assert!(!LivecastError::Unsupported("test".to_string()).is_user_recoverable());
}

#[test]
fn test_error_display_format() {
    let err = LivecastError::connection("Connection refused");
    assert_eq!(format!("{}", err), "Connection error: Connection refused");

    let err = LivecastError::send("Broken pipe");
    assert_eq!(format!("{}", err), "Send error: Broken pipe");

    let err = LivecastError::invalid_state("already streaming");
    assert_eq!(format!("{}", err), "Invalid state: already streaming");
}

#[test]
fn test_nested_context() {
    let err = LivecastError::device_open("/dev/video0 busy")
        .with_context("Opening camera")
        .with_context("Starting preview");

    let msg = format!("{}", err);
    assert!(msg.contains("Starting preview"));
    assert!(matches!(err.root(), LivecastError::DeviceOpen(_)));
    assert!(err.user_hint().is_some());
}

#[test]
fn test_io_error_conversion() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
    let err: LivecastError = io_err.into();

    let msg = format!("{}", err);
    assert!(msg.contains("I/O error"));
    assert!(msg.contains("File not found"));
}

#[test]
fn test_toml_error_conversion() {
    let parse: Result<toml::Value, _> = toml::from_str("key = ");
    let err: LivecastError = parse.unwrap_err().into();
    assert!(matches!(err, LivecastError::Config(_)));
}
