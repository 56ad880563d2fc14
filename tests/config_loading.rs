//! Loading expansion options from disk and wiring them into a manager.

use altre_template::config::ExpansionOptions;
use altre_template::error::ConfigError;
use altre_template::logging::{init_logging, LogLevel, Logger};
use altre_template::template::{parse, SessionState, StartParams, TemplateManager, Variable};
use altre_template::TextBuffer;
use std::fs;
use tempfile::tempdir;

#[test]
fn options_file_drives_headless_expansion() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("template.json");
    fs::write(&path, r#"{ "headless": true, "reformat": false }"#).unwrap();

    let options = ExpansionOptions::from_file(&path).unwrap();
    assert!(options.headless);
    assert!(!options.reformat);

    let mut manager = TemplateManager::with_options(options);
    let mut buffer = TextBuffer::new();
    let template = parse("println!(\"$MSG$\");$END$", vec![Variable::new("MSG")]).unwrap();
    let session = manager
        .start_template(&mut buffer, template, StartParams::new())
        .unwrap();

    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(buffer.text(), "println!(\"\");");
}

#[test]
fn missing_file_reports_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.json");

    match ExpansionOptions::from_file(&path) {
        Err(ConfigError::Io { path: reported, .. }) => {
            assert!(reported.ends_with("absent.json"));
        }
        other => panic!("expected an io error, got {:?}", other),
    }
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ \"headless\": ").unwrap();

    assert!(matches!(
        ExpansionOptions::from_file(&path),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn user_file_overrides_host_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("user.json");
    fs::write(&path, r#"{ "empty-variable-marker": "__", "log-level": "trace" }"#).unwrap();

    let host = ExpansionOptions::headless();
    let user = ExpansionOptions::from_file(&path).unwrap();
    let merged = host.merged_with(&user);

    assert!(merged.headless);
    assert_eq!(merged.empty_variable_marker, "__");
    assert_eq!(merged.log_level, LogLevel::Trace);
}

#[test]
fn session_activity_reaches_the_log_file() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("expansion.log");
    let logger = Logger::new(LogLevel::Debug)
        .without_stderr()
        .with_file_output(&log_path);
    assert!(init_logging(logger));

    let mut manager = TemplateManager::new();
    let mut buffer = TextBuffer::new();
    let template = parse("<$T$/>$END$", vec![Variable::new("T")])
        .unwrap()
        .with_key("tag");
    manager
        .start_template(&mut buffer, template, StartParams::new())
        .unwrap();
    manager.cancel_template(&mut buffer).unwrap();

    let contents = fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("template `tag`: started"));
    assert!(contents.contains("template `tag`: cancelled"));
    assert!(contents.lines().all(|line| !line.starts_with("TRACE")));
}
